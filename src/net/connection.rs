//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track each connection through New → Active ⇄ Idle → Closed
//! - Publish per-port state gauges
//!
//! Transitions are inferred from I/O on the wrapped stream: the first bytes
//! read mark a connection active, a flush after writing marks it idle, and
//! dropping the stream closes it.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum_server::accept::Accept;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::observability::metrics::Telemetry;

/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Accepted, no request bytes seen yet.
    New,
    /// Reading or serving a request.
    Active,
    /// Between requests on a kept-alive connection.
    Idle,
    /// Gone.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Active => "active",
            ConnectionState::Idle => "idle",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Per-port view of the tracked connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortSnapshot {
    pub new: u64,
    pub active: u64,
    pub idle: u64,
    pub closed: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    open: HashMap<ConnectionId, (u16, ConnectionState)>,
    closed: HashMap<u16, u64>,
}

/// Shared connection-state map, keyed by connection and grouped by listening port.
#[derive(Clone)]
pub struct ConnectionTracker {
    state: Arc<Mutex<TrackerState>>,
    telemetry: Telemetry,
}

impl ConnectionTracker {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            telemetry,
        }
    }

    /// Register a freshly accepted connection on `port`.
    pub fn open(&self, port: u16) -> ConnectionId {
        let id = ConnectionId::new();
        {
            let mut state = self.state.lock().expect("connection tracker mutex poisoned");
            state.open.insert(id, (port, ConnectionState::New));
        }
        self.telemetry.connection_transition(port, None, ConnectionState::New);
        tracing::trace!(connection_id = %id, port, "Connection accepted");
        id
    }

    /// Move a connection to `next`. Closing removes it from the map.
    pub fn transition(&self, id: ConnectionId, next: ConnectionState) {
        let change = {
            let mut state = self.state.lock().expect("connection tracker mutex poisoned");
            let Some(&(port, previous)) = state.open.get(&id) else {
                return;
            };
            if previous == next {
                return;
            }
            if next == ConnectionState::Closed {
                state.open.remove(&id);
                *state.closed.entry(port).or_insert(0) += 1;
            } else if let Some(entry) = state.open.get_mut(&id) {
                entry.1 = next;
            }
            (port, previous)
        };

        let (port, previous) = change;
        self.telemetry.connection_transition(port, Some(previous), next);
        tracing::trace!(connection_id = %id, port, from = previous.as_str(), to = next.as_str(), "Connection state changed");
    }

    /// Number of connections not yet closed.
    pub fn open_count(&self) -> usize {
        self.state.lock().expect("connection tracker mutex poisoned").open.len()
    }

    pub fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.state
            .lock()
            .expect("connection tracker mutex poisoned")
            .open
            .get(&id)
            .map(|(_, s)| *s)
    }

    /// Counts per port and state.
    pub fn snapshot(&self) -> BTreeMap<u16, PortSnapshot> {
        let state = self.state.lock().expect("connection tracker mutex poisoned");
        let mut out: BTreeMap<u16, PortSnapshot> = BTreeMap::new();
        for (port, conn_state) in state.open.values() {
            let entry = out.entry(*port).or_default();
            match conn_state {
                ConnectionState::New => entry.new += 1,
                ConnectionState::Active => entry.active += 1,
                ConnectionState::Idle => entry.idle += 1,
                ConnectionState::Closed => {}
            }
        }
        for (port, closed) in &state.closed {
            out.entry(*port).or_default().closed = *closed;
        }
        out
    }

    /// Wrap an accepted stream so its I/O drives the state machine.
    pub fn track<I>(&self, inner: I, port: u16) -> TrackedStream<I> {
        let id = self.open(port);
        TrackedStream {
            inner,
            tracker: self.clone(),
            id,
            local: ConnectionState::New,
            wrote: false,
        }
    }
}

/// Stream wrapper reporting state transitions to a [`ConnectionTracker`].
pub struct TrackedStream<I> {
    inner: I,
    tracker: ConnectionTracker,
    id: ConnectionId,
    local: ConnectionState,
    wrote: bool,
}

impl<I> TrackedStream<I> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn mark(&mut self, next: ConnectionState) {
        if self.local != next {
            self.local = next;
            self.tracker.transition(self.id, next);
        }
    }
}

impl<I> Drop for TrackedStream<I> {
    fn drop(&mut self) {
        self.tracker.transition(self.id, ConnectionState::Closed);
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for TrackedStream<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if buf.filled().len() > before {
                self.mark(ConnectionState::Active);
            }
        }
        poll
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for TrackedStream<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.wrote = true;
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_flush(cx);
        if let Poll::Ready(Ok(())) = poll {
            if self.wrote {
                self.wrote = false;
                self.mark(ConnectionState::Idle);
            }
        }
        poll
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.wrote = true;
            }
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// `axum-server` acceptor that wraps every accepted socket in a [`TrackedStream`].
#[derive(Clone)]
pub struct TrackingAcceptor {
    tracker: ConnectionTracker,
    port: u16,
}

impl TrackingAcceptor {
    pub fn new(tracker: ConnectionTracker, port: u16) -> Self {
        Self { tracker, port }
    }
}

impl<I, S> Accept<I, S> for TrackingAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    type Stream = TrackedStream<I>;
    type Service = S;
    type Future = std::future::Ready<io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        std::future::ready(Ok((self.tracker.track(stream, self.port), service)))
    }
}
