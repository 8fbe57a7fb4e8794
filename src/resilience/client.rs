//! Outbound HTTP client guarded by a circuit breaker command.
//!
//! Transport errors, timeouts and 5xx responses count as failures. A 5xx
//! response is still handed back to the caller.

use std::fmt;

use axum::body::Body;
use axum::http::{Method, Request, Response, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::resilience::circuit_breaker::{
    default_fallback, server_error, BreakerError, BreakerRegistry, Fallback,
};

/// Failure of the wrapped call itself.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] axum::http::Error),
    #[error("upstream request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
}

/// HTTP client whose calls all run under one breaker command.
#[derive(Clone)]
pub struct BreakerClient {
    client: Client<HttpConnector, Body>,
    registry: BreakerRegistry,
    command: String,
    fallback: Fallback<ClientError>,
}

impl fmt::Debug for BreakerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerClient")
            .field("command", &self.command)
            .field("registry", &self.registry)
            .finish()
    }
}

impl BreakerClient {
    pub fn new(registry: BreakerRegistry, command: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self::with_client(client, registry, command)
    }

    pub fn with_client(
        client: Client<HttpConnector, Body>,
        registry: BreakerRegistry,
        command: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            command: command.into(),
            fallback: default_fallback(),
        }
    }

    /// Replace the logging fallback. Its result is the error returned for
    /// rejections and failed calls, and the [`DegradedResponse`] attached to
    /// 5xx responses.
    ///
    /// [`DegradedResponse`]: crate::resilience::circuit_breaker::DegradedResponse
    pub fn with_fallback(mut self, fallback: Fallback<ClientError>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Send `request` under the breaker.
    pub async fn request(&self, request: Request<Body>) -> Result<Response<Body>, BreakerError<ClientError>> {
        let fallback = self.fallback.clone();
        let guarded = self
            .registry
            .guard(
                &self.command,
                || async move {
                    let response = self.client.request(request).await?;
                    Ok::<_, ClientError>(response.map(Body::new))
                },
                |response: &Response<Body>| server_error(response),
                move |err| fallback(err),
            )
            .await?;
        Ok(guarded.into_response())
    }

    pub async fn get(&self, uri: &str) -> Result<Response<Body>, BreakerError<ClientError>> {
        self.send(Method::GET, uri, Body::empty()).await
    }

    pub async fn head(&self, uri: &str) -> Result<Response<Body>, BreakerError<ClientError>> {
        self.send(Method::HEAD, uri, Body::empty()).await
    }

    pub async fn post(
        &self,
        uri: &str,
        content_type: &str,
        body: impl Into<Body>,
    ) -> Result<Response<Body>, BreakerError<ClientError>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(axum::http::header::CONTENT_TYPE, content_type)
            .body(body.into())
            .map_err(|e| BreakerError::Failure(ClientError::from(e)))?;
        self.request(request).await
    }

    async fn send(&self, method: Method, uri: &str, body: Body) -> Result<Response<Body>, BreakerError<ClientError>> {
        let uri: Uri = uri
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| BreakerError::Failure(ClientError::from(axum::http::Error::from(e))))?;
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .map_err(|e| BreakerError::Failure(ClientError::from(e)))?;
        self.request(request).await
    }
}
