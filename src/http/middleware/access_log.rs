//! One structured access record per request.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::http::request::{RequestContextExt, X_REQUEST_ID};
use crate::http::response::ResponseCapture;

/// Headers as a sorted map, minus the correlation header which is logged on its own.
fn header_fields(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str() != X_REQUEST_ID)
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            (name.as_str().to_string(), value)
        })
        .collect()
}

pub async fn access_log_middleware(request: Request<Body>, next: Next) -> Response {
    let capture = ResponseCapture::for_request(&request);
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = request.uri().path().to_string();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let method = request.method().clone();
    let proto = format!("{:?}", request.version());
    let request_headers = header_fields(request.headers());
    let (request_id, user, started) = match request.context() {
        Some(ctx) => (
            ctx.correlation_id.clone(),
            ctx.remote_user.clone().unwrap_or_default(),
            ctx.received_at,
        ),
        None => (String::new(), String::new(), std::time::Instant::now()),
    };

    let response = next.run(request).await;
    let response_headers = header_fields(response.headers());

    capture.on_complete(response, move |capture| {
        tracing::info!(
            target: "access",
            host = %host,
            url = %path,
            remote_ip = %remote,
            method = %method,
            proto = %proto,
            request_headers = ?request_headers,
            request_id = %request_id,
            status = capture.status_code(),
            length = capture.bytes_written(),
            response_headers = ?response_headers,
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            user = %user,
            "request"
        );
    })
}
