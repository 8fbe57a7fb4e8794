//! Per-route request metrics.

use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::http::response::ResponseCapture;
use crate::observability::metrics::Telemetry;

/// Route label for requests no route matched. Raw paths would let clients
/// mint unbounded series.
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub async fn metrics_middleware(
    State(telemetry): State<Telemetry>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let capture = ResponseCapture::for_request(&request);
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    telemetry.record_request_received(&route);
    let started = Instant::now();
    let response = next.run(request).await;

    capture.on_complete(response, move |capture| {
        telemetry.record_request_processed(
            &route,
            capture.status_code(),
            started.elapsed(),
            capture.bytes_written(),
        );
    })
}
