//! Inbound circuit breaker: guards a handler, any 5xx counts as a failure.

use std::convert::Infallible;
use std::fmt;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::http::response::ResponseCapture;
use crate::resilience::circuit_breaker::{default_fallback, BreakerRegistry, Fallback};

/// Breaker state for one guarded handler.
#[derive(Clone)]
pub struct BreakerRoute {
    pub registry: BreakerRegistry,
    pub command: String,
    fallback: Fallback<Infallible>,
}

impl BreakerRoute {
    pub fn new(registry: BreakerRegistry, command: impl Into<String>) -> Self {
        Self {
            registry,
            command: command.into(),
            fallback: default_fallback(),
        }
    }

    /// Replace the logging fallback. A rejection is answered with `503` and
    /// the fallback's error as the body.
    pub fn with_fallback(mut self, fallback: Fallback<Infallible>) -> Self {
        self.fallback = fallback;
        self
    }
}

impl fmt::Debug for BreakerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRoute")
            .field("command", &self.command)
            .finish()
    }
}

pub async fn breaker_middleware(
    State(route): State<BreakerRoute>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let capture = ResponseCapture::for_request(&request);
    let fallback = route.fallback.clone();
    let guarded = route
        .registry
        .guard(
            &route.command,
            || async move { Ok::<_, Infallible>(next.run(request).await) },
            |response: &Response| {
                capture.record(response);
                capture.effective_status().filter(StatusCode::is_server_error)
            },
            move |err| fallback(err),
        )
        .await;

    match guarded {
        Ok(guarded) => guarded.into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}
