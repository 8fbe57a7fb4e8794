//! Request pipeline assembly.
//!
//! Interceptors run outermost first:
//!
//! ```text
//! correlation id → response capture → metrics → access log → rate limit
//!     → caller interceptors (in the order given) → canonical host
//!     → compression → panic recovery → timeout → body limit → handler
//! ```
//!
//! axum applies `.layer()` calls inside-out, so [`Pipeline::wrap`] adds them
//! in reverse.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer, compression::CompressionLayer, limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
};

use crate::http::middleware::{
    access_log::access_log_middleware,
    canonical_host::{canonical_host_middleware, CanonicalHost},
    metrics::metrics_middleware,
};
use crate::http::request::correlation_middleware;
use crate::http::response::response_capture_middleware;
use crate::lifecycle::task_group::panic_message;
use crate::observability::metrics::Telemetry;
use crate::security::rate_limit::{rate_limit_middleware, RateLimiterState};

/// A caller-supplied stage: wraps the router in more middleware.
pub type Interceptor = Arc<dyn Fn(Router) -> Router + Send + Sync>;

pub fn interceptor<F>(f: F) -> Interceptor
where
    F: Fn(Router) -> Router + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The interceptor chain of one listener.
#[derive(Clone)]
pub struct Pipeline {
    listener: &'static str,
    telemetry: Telemetry,
    rate_limit: Option<Arc<RateLimiterState>>,
    interceptors: Vec<Interceptor>,
    canonical_host: Option<Arc<CanonicalHost>>,
    compression: bool,
    request_timeout: Option<Duration>,
    body_limit: Option<usize>,
}

impl Pipeline {
    /// The observability chain only: correlation, capture, metrics, access
    /// log and panic recovery.
    pub fn new(listener: &'static str, telemetry: Telemetry) -> Self {
        Self {
            listener,
            telemetry,
            rate_limit: None,
            interceptors: Vec::new(),
            canonical_host: None,
            compression: false,
            request_timeout: None,
            body_limit: None,
        }
    }

    pub fn listener(&self) -> &'static str {
        self.listener
    }

    pub fn rate_limit(mut self, state: Arc<RateLimiterState>) -> Self {
        self.rate_limit = Some(state);
        self
    }

    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Interceptor>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    pub fn canonical_host(mut self, host: CanonicalHost) -> Self {
        self.canonical_host = Some(Arc::new(host));
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = Some(bytes);
        self
    }

    /// Wrap `router` in the whole chain.
    #[allow(deprecated)]
    pub fn wrap(&self, router: Router) -> Router {
        let mut router = router;

        if let Some(limit) = self.body_limit {
            router = router.layer(RequestBodyLimitLayer::new(limit));
        }
        if let Some(timeout) = self.request_timeout {
            router = router.layer(TimeoutLayer::new(timeout));
        }
        router = router.layer(CatchPanicLayer::custom(panic_response));
        if self.compression {
            router = router.layer(CompressionLayer::new());
        }
        if let Some(host) = &self.canonical_host {
            router = router.layer(middleware::from_fn_with_state(Arc::clone(host), canonical_host_middleware));
        }
        for interceptor in self.interceptors.iter().rev() {
            router = interceptor(router);
        }
        if let Some(state) = &self.rate_limit {
            router = router.layer(middleware::from_fn_with_state(Arc::clone(state), rate_limit_middleware));
        }

        router
            .layer(middleware::from_fn(access_log_middleware))
            .layer(middleware::from_fn_with_state(self.telemetry.clone(), metrics_middleware))
            .layer(middleware::from_fn(response_capture_middleware))
            .layer(middleware::from_fn(correlation_middleware))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("listener", &self.listener)
            .field("rate_limit", &self.rate_limit.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("canonical_host", &self.canonical_host)
            .field("compression", &self.compression)
            .field("request_timeout", &self.request_timeout)
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic_message(payload.as_ref());
    let backtrace = std::backtrace::Backtrace::capture();
    tracing::error!(panic = %message, backtrace = %backtrace, "Handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Internal Server Error",
    )
        .into_response()
}
