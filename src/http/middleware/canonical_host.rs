//! Redirect requests for a non-canonical host.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Canonical scheme and host for a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalHost {
    scheme: String,
    host: String,
}

impl CanonicalHost {
    /// Accepts `host`, `host:port` or `scheme://host[:port]`. Without a scheme
    /// the listener's own (`https` when TLS is on) is used.
    pub fn new(canonical: &str, tls: bool) -> Self {
        let canonical = canonical.trim().trim_end_matches('/');
        let (scheme, host) = match canonical.split_once("://") {
            Some((scheme, host)) => (scheme.to_ascii_lowercase(), host),
            None => (if tls { "https" } else { "http" }.to_string(), canonical),
        };
        Self {
            scheme,
            host: host.to_ascii_lowercase(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn matches(&self, host: &str) -> bool {
        host.eq_ignore_ascii_case(&self.host)
    }

    fn location<B>(&self, request: &Request<B>) -> String {
        let path = request
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        format!("{}://{}{}", self.scheme, self.host, path)
    }
}

pub async fn canonical_host_middleware(
    State(canonical): State<Arc<CanonicalHost>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()));

    match host {
        Some(host) if !canonical.matches(&host) => {
            let location = canonical.location(&request);
            tracing::debug!(from = %host, to = %location, "Redirecting to canonical host");
            match HeaderValue::from_str(&location) {
                Ok(value) => (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, value)]).into_response(),
                Err(_) => next.run(request).await,
            }
        }
        _ => next.run(request).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app(canonical: CanonicalHost) -> Router {
        Router::new()
            .route("/{*path}", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(Arc::new(canonical), canonical_host_middleware))
    }

    #[tokio::test]
    async fn other_host_is_redirected_with_path_and_query() {
        let response = app(CanonicalHost::new("www.example.com", true))
            .oneshot(
                Request::builder()
                    .uri("/a/b?x=1")
                    .header("Host", "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "https://www.example.com/a/b?x=1");
    }

    #[tokio::test]
    async fn canonical_host_passes_through() {
        let response = app(CanonicalHost::new("http://WWW.example.com:8443", false))
            .oneshot(
                Request::builder()
                    .uri("/a")
                    .header("Host", "www.example.com:8443")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
