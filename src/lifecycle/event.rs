//! Termination events funnelled from listener tasks to the shutdown coordinator.

use std::fmt;

use crate::net::listener::ListenerError;

/// Which part of the runtime produced a termination event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventSource {
    /// Process interrupt (SIGINT / SIGTERM / Ctrl+C).
    Interrupt,
    /// The plain request/response listener.
    PlainListener,
    /// The RPC listener.
    RpcListener,
    /// The metrics / health listener.
    MetricsListener,
    /// An externally supplied shutdown signal.
    Unknown,
}

impl EventSource {
    /// Whether this source is a listener the coordinator can stop.
    pub fn is_listener(&self) -> bool {
        matches!(
            self,
            EventSource::PlainListener | EventSource::RpcListener | EventSource::MetricsListener
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Interrupt => "interrupt",
            EventSource::PlainListener => "plainListener",
            EventSource::RpcListener => "rpcListener",
            EventSource::MetricsListener => "metricsListener",
            EventSource::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A termination notice. Consumed exactly once by the coordinator.
#[derive(Debug)]
pub struct Event {
    pub source: EventSource,
    pub err: Option<EventError>,
}

/// Error carried by an [`Event`].
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("received signal {0}")]
    Signal(&'static str),
}

impl Event {
    pub fn new(source: EventSource, err: Option<EventError>) -> Self {
        Self { source, err }
    }

    /// A listener or signal that ended without error.
    pub fn clean(source: EventSource) -> Self {
        Self { source, err: None }
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.err {
            Some(err) => write!(f, "{}: {}", self.source, err),
            None => write!(f, "{}", self.source),
        }
    }
}
