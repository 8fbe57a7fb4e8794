//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGINT, SIGTERM and SIGQUIT
//! - Translate every received signal into an interrupt [`Event`]
//! - Forward an externally supplied shutdown future instead, when configured
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The watcher keeps running after the first signal; a second one reaches
//!   the coordinator while it is shutting down and forces the stop

use std::future::Future;

use tokio::task::JoinHandle;

use crate::lifecycle::event::{Event, EventError, EventSource};
use crate::lifecycle::supervisor::EventSender;
use crate::lifecycle::task_group::TaskGroup;

/// Termination signal streams. Registered once, so a signal arriving
/// between two waits is still delivered.
#[cfg(unix)]
#[derive(Debug)]
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the next termination signal and return its name.
    pub async fn recv(&mut self) -> std::io::Result<&'static str> {
        let name = tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigquit.recv() => "SIGQUIT",
        };
        Ok(name)
    }
}

#[cfg(not(unix))]
#[derive(Debug)]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> std::io::Result<&'static str> {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

/// Spawn a task in `tasks` that reports every OS termination signal as an
/// [`EventSource::Interrupt`] event. Handlers are installed before this
/// returns. Abort the handle once shutdown is over.
pub fn spawn_interrupt_watcher(events: EventSender, tasks: &TaskGroup) -> JoinHandle<()> {
    let signals = ShutdownSignals::new();
    tasks.spawn("signal-watcher", async move {
        let mut signals = match signals {
            Ok(signals) => signals,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };
        loop {
            match signals.recv().await {
                Ok(name) => {
                    tracing::info!(signal = name, "Received shutdown signal");
                    let event = Event::new(EventSource::Interrupt, Some(EventError::Signal(name)));
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Signal handling failed");
                    break;
                }
            }
        }
        tracing::debug!("Signal monitor routine has exited");
    })
}

/// Forward a caller-supplied shutdown future as an [`EventSource::Unknown`] event.
pub fn spawn_external_watcher<F>(signal: F, events: EventSender, tasks: &TaskGroup) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tasks.spawn("shutdown-watcher", async move {
        signal.await;
        tracing::debug!("External shutdown signal fired, initiating graceful shutdown");
        let _ = events.send(Event::clean(EventSource::Unknown));
    })
}
