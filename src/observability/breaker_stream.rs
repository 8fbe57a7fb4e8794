//! Live circuit breaker feed in the Hystrix dashboard format.

use std::convert::Infallible;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};

use crate::resilience::circuit_breaker::{BreakerRegistry, CircuitState, Command};

const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// One `HystrixCommand` record for `command`.
pub fn hystrix_command(command: &Command) -> Value {
    let snapshot = command.snapshot();
    let config = command.config();
    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    json!({
        "type": "HystrixCommand",
        "name": snapshot.name,
        "group": snapshot.name,
        "currentTime": current_time,
        "isCircuitBreakerOpen": snapshot.state != CircuitState::Closed,
        "errorPercentage": snapshot.error_percentage.round() as u64,
        "errorCount": snapshot.rolling.errors(),
        "requestCount": snapshot.rolling.requests(),
        "rollingCountSuccess": snapshot.rolling.successes,
        "rollingCountFailure": snapshot.rolling.failures,
        "rollingCountTimeout": snapshot.rolling.timeouts,
        "rollingCountShortCircuited": snapshot.rolling.short_circuited,
        "rollingCountSemaphoreRejected": snapshot.rolling.rejected,
        "currentConcurrentExecutionCount": snapshot.in_flight,
        "reportingHosts": 1,
        "propertyValue_circuitBreakerRequestVolumeThreshold": config.request_volume_threshold,
        "propertyValue_circuitBreakerSleepWindowInMilliseconds": config.sleep_window.as_millis() as u64,
        "propertyValue_circuitBreakerErrorThresholdPercentage": config.error_percent_threshold,
        "propertyValue_executionIsolationSemaphoreMaxConcurrentRequests": snapshot.max_concurrent,
        "propertyValue_executionIsolationThreadTimeoutInMilliseconds":
            config.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
        "propertyValue_metricsRollingStatisticalWindowInMilliseconds": config.rolling_window.as_millis() as u64,
    })
}

/// Every `period`, one JSON record per known command.
pub fn snapshot_stream(registry: BreakerRegistry, period: Duration) -> impl Stream<Item = String> + Send + 'static {
    let ticker = tokio::time::interval(period);
    stream::unfold((registry, ticker), |(registry, mut ticker)| async move {
        ticker.tick().await;
        let records: Vec<String> = registry
            .commands()
            .iter()
            .map(|command| hystrix_command(command).to_string())
            .collect();
        Some((stream::iter(records), (registry, ticker)))
    })
    .flatten()
}

/// `GET /hystrix`: server-sent events, one per command per second.
pub async fn hystrix_stream(
    State(registry): State<BreakerRegistry>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = snapshot_stream(registry, PUBLISH_INTERVAL).map(|record| Ok(Event::default().data(record)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::Telemetry;
    use crate::resilience::circuit_breaker::CommandConfig;

    #[tokio::test]
    async fn records_follow_command_state() {
        let registry = BreakerRegistry::new(CommandConfig::default(), Telemetry::new());
        registry.admit("payments").unwrap().failure();
        registry.admit("payments").unwrap().success();
        registry.command("search");

        let mut stream = Box::pin(snapshot_stream(registry, Duration::from_millis(10)));
        let first: Value = serde_json::from_str(&stream.next().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&stream.next().await.unwrap()).unwrap();

        assert_eq!(first["type"], "HystrixCommand");
        assert_eq!(first["name"], "payments");
        assert_eq!(first["requestCount"], 2);
        assert_eq!(first["errorCount"], 1);
        assert_eq!(first["errorPercentage"], 50);
        assert_eq!(first["isCircuitBreakerOpen"], false);
        assert_eq!(first["propertyValue_executionIsolationSemaphoreMaxConcurrentRequests"], 100);
        assert_eq!(second["name"], "search");
        assert_eq!(second["requestCount"], 0);
    }
}
