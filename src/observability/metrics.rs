//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_received_total` (counter): requests seen, by route
//! - `http_requests_processed_total` (counter): requests answered, by route and status
//! - `http_response_duration_seconds` (summary): latency, by route and status
//! - `http_response_size_bytes` (summary): body size, by route
//! - `http_requests_rate_limited_total` (counter): rejected by the token bucket, by listener
//! - `http_conn_new` / `http_conn_active` / `http_conn_idle` (gauges): connections per port
//! - `http_conn_closed_total` (counter): closed connections per port
//! - `breaker_events_total` (counter): breaker outcomes, by command and outcome
//! - `breaker_open` (gauge): 1 while a command's circuit is not closed
//!
//! # Design Decisions
//! - The recorder is owned by [`Telemetry`] and never installed globally;
//!   every update runs under `metrics::with_local_recorder`.
//! - Histograms render as Prometheus summaries (exporter default).

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use crate::net::connection::ConnectionState;

/// Process-local metrics registry shared through the runtime context.
#[derive(Clone)]
pub struct Telemetry {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl Telemetry {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let telemetry = Self {
            recorder: Arc::new(recorder),
            handle,
        };
        telemetry.describe();
        telemetry
    }

    fn with<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(self.recorder.as_ref(), f)
    }

    fn describe(&self) {
        self.with(|| {
            describe_counter!("http_requests_received_total", "Number of HTTP requests received.");
            describe_counter!("http_requests_processed_total", "Number of HTTP requests processed.");
            describe_histogram!(
                "http_response_duration_seconds",
                Unit::Seconds,
                "Duration of HTTP responses."
            );
            describe_histogram!("http_response_size_bytes", Unit::Bytes, "Size of HTTP responses.");
            describe_counter!(
                "http_requests_rate_limited_total",
                "Requests rejected by the rate limiter."
            );
            describe_gauge!("http_conn_new", "Number of new http/tcp connections.");
            describe_gauge!("http_conn_active", "Number of active http/tcp connections.");
            describe_gauge!("http_conn_idle", "Number of idle http/tcp connections.");
            describe_counter!("http_conn_closed_total", "Number of closed http/tcp connections.");
            describe_counter!("breaker_events_total", "Circuit breaker outcomes per command.");
            describe_gauge!("breaker_open", "1 while the command's circuit is open or half-open.");
        });
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> String {
        self.handle.run_upkeep();
        self.handle.render()
    }

    pub fn record_request_received(&self, route: &str) {
        let route = route.to_string();
        self.with(|| counter!("http_requests_received_total", "route" => route).increment(1));
    }

    pub fn record_request_processed(&self, route: &str, status: u16, duration: Duration, bytes: u64) {
        let route = route.to_string();
        let status = status.to_string();
        self.with(|| {
            counter!("http_requests_processed_total", "route" => route.clone(), "status" => status.clone())
                .increment(1);
            histogram!("http_response_duration_seconds", "route" => route.clone(), "status" => status)
                .record(duration.as_secs_f64());
            histogram!("http_response_size_bytes", "route" => route).record(bytes as f64);
        });
    }

    pub fn record_rate_limited(&self, listener: &str) {
        let listener = listener.to_string();
        self.with(|| counter!("http_requests_rate_limited_total", "listener" => listener).increment(1));
    }

    /// Move one connection between the per-port state gauges.
    pub fn connection_transition(&self, port: u16, from: Option<ConnectionState>, to: ConnectionState) {
        let port = port.to_string();
        self.with(|| {
            if let Some(name) = from.and_then(conn_gauge_name) {
                gauge!(name, "port" => port.clone()).decrement(1.0);
            }
            match conn_gauge_name(to) {
                Some(name) => gauge!(name, "port" => port).increment(1.0),
                None => counter!("http_conn_closed_total", "port" => port).increment(1),
            }
        });
    }

    pub fn record_breaker_event(&self, command: &str, outcome: &'static str) {
        let command = command.to_string();
        self.with(|| {
            counter!("breaker_events_total", "command" => command, "outcome" => outcome).increment(1)
        });
    }

    pub fn record_breaker_open(&self, command: &str, open: bool) {
        let command = command.to_string();
        self.with(|| gauge!("breaker_open", "command" => command).set(if open { 1.0 } else { 0.0 }));
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

fn conn_gauge_name(state: ConnectionState) -> Option<&'static str> {
    match state {
        ConnectionState::New => Some("http_conn_new"),
        ConnectionState::Active => Some("http_conn_active"),
        ConnectionState::Idle => Some("http_conn_idle"),
        ConnectionState::Closed => None,
    }
}
