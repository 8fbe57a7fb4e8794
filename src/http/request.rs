//! Request-scoped context and correlation ids.
//!
//! # Responsibilities
//! - Reuse the inbound `X-Request-Id` or generate a UUID
//! - Pick up the pre-authenticated `X-Remote-User`
//! - Attach both, with the arrival time, as a [`RequestContext`] extension
//! - Echo the correlation id on the response
//!
//! # Design Decisions
//! - Correlation id assigned as early as possible; it is the outermost interceptor
//! - Every request runs inside a `request` span carrying the id

use std::time::{Instant, SystemTime};

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

/// Correlation id header, on requests and responses.
pub const X_REQUEST_ID: &str = "x-request-id";
/// Pre-authenticated identity header, inbound only.
pub const X_REMOTE_USER: &str = "x-remote-user";

/// Per-request record threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub remote_user: Option<String>,
    pub received_at: Instant,
    pub received_wall: SystemTime,
}

impl RequestContext {
    /// Build the context for `request`, reusing its correlation id if present.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let correlation_id = header_str(request, X_REQUEST_ID)
            .map(str::to_string)
            .unwrap_or_else(new_correlation_id);
        let remote_user = header_str(request, X_REMOTE_USER).map(str::to_string);
        Self {
            correlation_id,
            remote_user,
            received_at: Instant::now(),
            received_wall: SystemTime::now(),
        }
    }
}

/// Access to the [`RequestContext`] of a request.
pub trait RequestContextExt {
    fn context(&self) -> Option<&RequestContext>;

    fn correlation_id(&self) -> Option<&str> {
        self.context().map(|c| c.correlation_id.as_str())
    }
}

impl<B> RequestContextExt for Request<B> {
    fn context(&self) -> Option<&RequestContext> {
        self.extensions().get::<RequestContext>()
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn header_str<'a, B>(request: &'a Request<B>, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Assign the correlation id and request context.
pub async fn correlation_middleware(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::from_request(&request);
    let id = ctx.correlation_id.clone();
    let header = HeaderValue::from_str(&id).ok();

    if let Some(value) = &header {
        request.headers_mut().insert(X_REQUEST_ID, value.clone());
    }
    request.extensions_mut().insert(ctx);

    let span = tracing::info_span!("request", request_id = %id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/",
                get(|request: Request<Body>| async move {
                    let ctx = request.context().cloned().unwrap();
                    format!("{}|{}", ctx.correlation_id, ctx.remote_user.unwrap_or_default())
                }),
            )
            .layer(middleware::from_fn(correlation_middleware))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn existing_id_is_echoed() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-Id", "abc123")
                    .header("X-Remote-User", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[X_REQUEST_ID], "abc123");
        assert_eq!(body_text(response).await, "abc123|alice");
    }

    #[tokio::test]
    async fn missing_id_is_generated() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
        assert!(!id.is_empty());
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(body_text(response).await, format!("{id}|"));
    }

    #[test]
    fn blank_header_counts_as_missing() {
        let request = Request::builder()
            .header(X_REQUEST_ID, "   ")
            .body(())
            .unwrap();
        let ctx = RequestContext::from_request(&request);
        assert_ne!(ctx.correlation_id.trim(), "");
        assert!(ctx.remote_user.is_none());
    }
}
