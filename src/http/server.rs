//! Router construction for each listener kind.
//!
//! # Responsibilities
//! - Wrap the plain and RPC routers in the full request pipeline
//! - Run the RPC registration callback
//! - Serve `/metrics`, `/hystrix` and `/debug/vars` on the metrics listener,
//!   handing every other path to the caller's router

use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::config::options::RpcRegistration;
use crate::config::schema::RuntimeSettings;
use crate::http::middleware::canonical_host::CanonicalHost;
use crate::http::pipeline::{Interceptor, Pipeline};
use crate::net::listener::ListenerError;
use crate::observability::breaker_stream::hystrix_stream;
use crate::observability::debug_vars::debug_vars_handler;
use crate::observability::metrics::Telemetry;
use crate::runtime::RuntimeContext;
use crate::security::rate_limit::{RateLimiter, RateLimiterState};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// The full pipeline for the plain or RPC listener.
pub fn service_pipeline(
    listener: &'static str,
    settings: &RuntimeSettings,
    interceptors: &[Interceptor],
    tls: bool,
    ctx: &RuntimeContext,
) -> Pipeline {
    let mut pipeline = Pipeline::new(listener, ctx.telemetry().clone())
        .interceptors(interceptors.iter().cloned())
        .compression(settings.compression)
        .request_timeout(settings.request_timeout())
        .body_limit(settings.max_body_bytes);

    if settings.rate_limit.enabled {
        let limits = &settings.rate_limit;
        pipeline = pipeline.rate_limit(Arc::new(RateLimiterState {
            limiter: RateLimiter::new(limits.requests_per_second, limits.burst, limits.key),
            listener,
            telemetry: ctx.telemetry().clone(),
        }));
    }
    if let Some(host) = &settings.canonical_host {
        pipeline = pipeline.canonical_host(CanonicalHost::new(host, tls));
    }
    pipeline
}

/// Let the caller register its RPC endpoints.
pub fn rpc_router(registration: RpcRegistration) -> Result<Router, ListenerError> {
    registration(Router::new()).map_err(|e| ListenerError::Setup(e.to_string()))
}

/// Built-in observability endpoints merged with the caller's `routes` (its
/// fallback included), wrapped in the observability-only pipeline.
pub fn metrics_router(routes: Router, ctx: &RuntimeContext) -> Router {
    let metrics = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(ctx.telemetry().clone());
    let hystrix = Router::new()
        .route("/hystrix", get(hystrix_stream))
        .with_state(ctx.breakers().clone());
    let vars = Router::new()
        .route("/debug/vars", get(debug_vars_handler))
        .with_state(ctx.clone());

    let router = metrics.merge(hystrix).merge(vars).merge(routes);
    Pipeline::new("metricsListener", ctx.telemetry().clone()).wrap(router)
}

async fn render_metrics(State(telemetry): State<Telemetry>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], telemetry.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::options::BoxError;
    use crate::health::HealthChecks;
    use crate::lifecycle::TaskGroup;
    use crate::resilience::circuit_breaker::CommandConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn ctx() -> RuntimeContext {
        RuntimeContext::new("echo", TaskGroup::new(), CommandConfig::default())
    }

    async fn get_text(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn metrics_listener_serves_builtin_and_fallback_routes() {
        let ctx = ctx();
        let router = metrics_router(HealthChecks::new().router(), &ctx);

        let (status, body) = get_text(router.clone(), "/healthz/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{}\n");

        let (status, body) = get_text(router.clone(), "/debug/vars").await;
        assert_eq!(status, StatusCode::OK);
        let vars: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(vars["service"], "echo");

        let (status, body) = get_text(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("http_requests_processed_total{route=\"/healthz/live\",status=\"200\"} 1"));
    }

    #[test]
    fn failed_registration_is_a_setup_error() {
        let err = rpc_router(Box::new(|_router: Router| Err::<Router, BoxError>("no services".into()))).unwrap_err();
        assert!(matches!(err, ListenerError::Setup(message) if message == "no services"));
    }

    #[tokio::test]
    async fn rate_limit_follows_settings() {
        let mut settings = RuntimeSettings::default();
        settings.rate_limit.enabled = true;
        settings.rate_limit.requests_per_second = 0.001;
        settings.rate_limit.burst = 1;
        let router = service_pipeline("plainListener", &settings, &[], false, &ctx())
            .wrap(Router::new().route("/", get(|| async { "ok" })));

        assert_eq!(get_text(router.clone(), "/").await.0, StatusCode::OK);
        assert_eq!(get_text(router, "/").await.0, StatusCode::TOO_MANY_REQUESTS);
    }
}
