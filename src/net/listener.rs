//! TCP/TLS listener binding and the serve loop.
//!
//! # Responsibilities
//! - Bind the configured address
//! - Optionally terminate TLS
//! - Wrap every accepted connection for state tracking
//! - Expose a stop handle the shutdown coordinator can drive

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsAcceptor;
use axum_server::Handle;
use futures_util::future::BoxFuture;

use crate::lifecycle::supervisor::ListenerControl;
use crate::net::connection::{ConnectionTracker, TrackingAcceptor};
use crate::net::tls::{TlsError, TlsMaterial};

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// TLS material could not be loaded.
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
    /// The listener's router could not be assembled.
    #[error("listener setup failed: {0}")]
    Setup(String),
    /// The serve loop ended with an I/O error.
    #[error("serve loop failed: {0}")]
    Serve(#[source] io::Error),
    /// Open connections did not drain within the stop deadline.
    #[error("connections still open after {0:?}")]
    StopTimeout(Duration),
    /// The listener task panicked.
    #[error("listener task panicked: {0}")]
    Panicked(String),
    /// The listener was already closed; a normal end of serving.
    #[error("listener closed")]
    Closed,
}

impl ListenerError {
    /// Whether this denotes a normal "already closed" termination.
    pub fn is_closed(&self) -> bool {
        matches!(self, ListenerError::Closed)
    }
}

/// Stop handle for a listener served by `axum-server`.
#[derive(Clone)]
pub struct ServeHandle {
    inner: Handle,
}

impl ServeHandle {
    pub fn new() -> Self {
        Self {
            inner: Handle::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.inner.clone()
    }

    /// Connections still being served.
    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }
}

impl Default for ServeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeHandle")
            .field("connections", &self.inner.connection_count())
            .finish()
    }
}

impl ListenerControl for ServeHandle {
    fn stop(&self, deadline: Duration) -> BoxFuture<'static, Result<(), ListenerError>> {
        let handle = self.inner.clone();
        Box::pin(async move {
            // connections are only cut by force_stop
            handle.graceful_shutdown(None);
            let drained = tokio::time::timeout(deadline, async {
                while handle.connection_count() > 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            drained.map_err(|_| ListenerError::StopTimeout(deadline))
        })
    }

    fn force_stop(&self) {
        self.inner.shutdown();
    }
}

/// Bind `addr` and serve `router` until the handle is told to stop.
///
/// Returns `Ok(())` when serving ended because of a stop request.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    tls: Option<TlsMaterial>,
    handle: ServeHandle,
    tracker: ConnectionTracker,
) -> Result<(), ListenerError> {
    let std_listener =
        std::net::TcpListener::bind(addr).map_err(|source| ListenerError::Bind { addr, source })?;
    std_listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::Bind { addr, source })?;
    let local_addr = std_listener
        .local_addr()
        .map_err(|source| ListenerError::Bind { addr, source })?;

    let tracking = TrackingAcceptor::new(tracker, local_addr.port());
    let app = router.into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        None => {
            tracing::info!(address = %local_addr, "Listener bound");
            axum_server::from_tcp(std_listener)
                .handle(handle.handle())
                .acceptor(tracking)
                .serve(app)
                .await
                .map_err(ListenerError::Serve)?;
        }
        Some(material) => {
            let config = material.resolve().await?;
            tracing::info!(address = %local_addr, "TLS listener bound");
            axum_server::from_tcp(std_listener)
                .handle(handle.handle())
                .acceptor(RustlsAcceptor::new(config).acceptor(tracking))
                .serve(app)
                .await
                .map_err(ListenerError::Serve)?;
        }
    }

    tracing::debug!(address = %local_addr, "Listener stopped");
    Ok(())
}
