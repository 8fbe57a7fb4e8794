//! Tower transport hook: a breaker command around any HTTP service.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{Request, Response};
use tower::{Layer, Service};

use crate::resilience::circuit_breaker::{
    default_fallback, server_error, BreakerError, BreakerRegistry, Fallback,
};

/// `E` is the wrapped service's error type.
pub struct CircuitBreakerLayer<E> {
    registry: BreakerRegistry,
    command: String,
    fallback: Fallback<E>,
}

impl<E: fmt::Display + 'static> CircuitBreakerLayer<E> {
    pub fn new(registry: BreakerRegistry, command: impl Into<String>) -> Self {
        Self {
            registry,
            command: command.into(),
            fallback: default_fallback(),
        }
    }
}

impl<E> CircuitBreakerLayer<E> {
    /// Replace the logging fallback.
    pub fn with_fallback(mut self, fallback: Fallback<E>) -> Self {
        self.fallback = fallback;
        self
    }
}

impl<E> Clone for CircuitBreakerLayer<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            command: self.command.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<E> fmt::Debug for CircuitBreakerLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerLayer")
            .field("command", &self.command)
            .finish()
    }
}

impl<S, E> Layer<S> for CircuitBreakerLayer<E> {
    type Service = CircuitBreakerService<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            registry: self.registry.clone(),
            command: self.command.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

/// Counts inner errors and 5xx responses as failures.
pub struct CircuitBreakerService<S, E> {
    inner: S,
    registry: BreakerRegistry,
    command: String,
    fallback: Fallback<E>,
}

impl<S: Clone, E> Clone for CircuitBreakerService<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registry: self.registry.clone(),
            command: self.command.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<S, E> fmt::Debug for CircuitBreakerService<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerService")
            .field("command", &self.command)
            .finish()
    }
}

impl<S, E, B, RB> Service<Request<B>> for CircuitBreakerService<S, E>
where
    S: Service<Request<B>, Response = Response<RB>, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
    E: fmt::Display + Send + 'static,
    B: Send + 'static,
    RB: Send + 'static,
{
    type Response = Response<RB>;
    type Error = BreakerError<E>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(BreakerError::Failure)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let registry = self.registry.clone();
        let command = self.command.clone();
        let fallback = self.fallback.clone();

        Box::pin(async move {
            let guarded = registry
                .guard(
                    &command,
                    move || inner.call(request),
                    |response: &Response<RB>| server_error(response),
                    move |err| fallback(err),
                )
                .await?;
            Ok(guarded.into_response())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::Telemetry;
    use crate::resilience::circuit_breaker::{fallback, CircuitState, CommandConfig, DegradedResponse};
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(
            CommandConfig {
                request_volume_threshold: 3,
                sleep_window: Duration::from_secs(60),
                ..CommandConfig::default()
            },
            Telemetry::new(),
        )
    }

    #[tokio::test]
    async fn server_errors_trip_the_transport_breaker() {
        let registry = registry();
        let service = ServiceBuilder::new()
            .layer(CircuitBreakerLayer::<Infallible>::new(registry.clone(), "upstream"))
            .service(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(StatusCode::BAD_GATEWAY)
                        .body(())
                        .unwrap(),
                )
            }));

        for _ in 0..3 {
            let response = service.clone().oneshot(Request::new(())).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert!(response.extensions().get::<DegradedResponse>().is_some());
        }
        assert_eq!(registry.state("upstream"), CircuitState::Open);

        let err = service.clone().oneshot(Request::new(())).await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn inner_errors_are_failures() {
        let registry = registry();
        let service = CircuitBreakerLayer::<&str>::new(registry.clone(), "flaky").layer(service_fn(
            |_req: Request<()>| async { Err::<Response<()>, _>("connection reset") },
        ));

        let err = service.oneshot(Request::new(())).await.unwrap_err();
        assert!(matches!(err, BreakerError::Failure("connection reset")));
        assert_eq!(registry.command("flaky").snapshot().rolling.failures, 1);
    }

    #[tokio::test]
    async fn success_is_recorded() {
        let registry = registry();
        let service = CircuitBreakerLayer::<Infallible>::new(registry.clone(), "healthy").layer(service_fn(
            |_req: Request<()>| async { Ok::<_, Infallible>(Response::new(())) },
        ));

        service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(registry.command("healthy").snapshot().rolling.successes, 1);
    }

    #[tokio::test]
    async fn fallback_sees_inner_errors() {
        let registry = registry();
        let layer = CircuitBreakerLayer::<&str>::new(registry.clone(), "wrapped")
            .with_fallback(fallback(|err| match err {
                BreakerError::Failure(_) => BreakerError::Failure("upstream unavailable"),
                other => other,
            }));
        let service = layer.layer(service_fn(|_req: Request<()>| async {
            Err::<Response<()>, _>("connection reset")
        }));

        let err = service.oneshot(Request::new(())).await.unwrap_err();
        assert!(matches!(err, BreakerError::Failure("upstream unavailable")));
    }
}
