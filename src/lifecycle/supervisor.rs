//! Listener supervision.
//!
//! Each registered listener runs as its own task. Whatever ends its serve
//! loop (a stop request, a bind failure, a panic) is turned into exactly one
//! [`Event`] on the shared event channel.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::lifecycle::event::{Event, EventSource};
use crate::lifecycle::task_group::{panic_message, TaskGroup};
use crate::net::listener::ListenerError;

/// Sending half of the event channel.
pub type EventSender = mpsc::UnboundedSender<Event>;
/// Receiving half of the event channel; owned by the shutdown coordinator.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the channel listener tasks and signal watchers report into.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// How the coordinator asks a running listener to stop.
pub trait ListenerControl: Send + Sync {
    /// Stop accepting and drain in-flight work within `deadline`.
    fn stop(&self, deadline: Duration) -> BoxFuture<'static, Result<(), ListenerError>>;

    /// Abort serving immediately, dropping open connections.
    fn force_stop(&self);
}

struct Registration {
    source: EventSource,
    run: BoxFuture<'static, Result<(), ListenerError>>,
    control: Arc<dyn ListenerControl>,
}

/// A started listener as seen by the shutdown coordinator.
#[derive(Clone)]
pub struct ListenerHandle {
    source: EventSource,
    control: Arc<dyn ListenerControl>,
    finished: Arc<AtomicBool>,
}

impl ListenerHandle {
    pub fn source(&self) -> EventSource {
        self.source
    }

    /// False once the listener task has produced its event.
    pub fn is_running(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    pub fn stop(&self, deadline: Duration) -> BoxFuture<'static, Result<(), ListenerError>> {
        self.control.stop(deadline)
    }

    pub fn force_stop(&self) {
        self.control.force_stop();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("source", &self.source)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Starts registered listeners and funnels their terminations into one channel.
pub struct ListenerSupervisor {
    tasks: TaskGroup,
    registrations: Vec<Registration>,
}

impl ListenerSupervisor {
    pub fn new(tasks: TaskGroup) -> Self {
        Self {
            tasks,
            registrations: Vec::new(),
        }
    }

    /// Record a listener to be started. `run` resolves when its serve loop ends.
    pub fn register_listener<F, C>(&mut self, source: EventSource, run: F, control: C)
    where
        F: Future<Output = Result<(), ListenerError>> + Send + 'static,
        C: ListenerControl + 'static,
    {
        self.registrations.push(Registration {
            source,
            run: Box::pin(run),
            control: Arc::new(control),
        });
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Launch every registered listener. Each task is counted in the task
    /// group before it starts and sends exactly one event when it ends.
    ///
    /// With nothing registered this returns an empty set and spawns nothing.
    pub fn start(self, events: &EventSender) -> Vec<ListenerHandle> {
        let mut handles = Vec::with_capacity(self.registrations.len());

        for Registration { source, run, control } in self.registrations {
            let finished = Arc::new(AtomicBool::new(false));
            handles.push(ListenerHandle {
                source,
                control,
                finished: Arc::clone(&finished),
            });

            let guard = self.tasks.enter();
            let tx = events.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let result = AssertUnwindSafe(run)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(ListenerError::Panicked(panic_message(payload.as_ref()))));

                let event = match result {
                    Ok(()) => {
                        tracing::info!(source = %source, "Listener closed");
                        Event::clean(source)
                    }
                    Err(err) if err.is_closed() => {
                        tracing::info!(source = %source, "Listener already closed");
                        Event::clean(source)
                    }
                    Err(err) => {
                        tracing::error!(source = %source, error = %err, "Listener terminated");
                        Event::new(source, Some(err.into()))
                    }
                };

                finished.store(true, Ordering::SeqCst);
                if tx.send(event).is_err() {
                    tracing::debug!(source = %source, "Event channel closed before listener exit was reported");
                }
                tracing::debug!(source = %source, "Listener task has exited");
            });
        }

        handles
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Notify;

    /// In-memory listener whose serve loop ends when it is notified.
    #[derive(Clone)]
    pub struct FakeListener {
        notify: Arc<Notify>,
        honors_stop: bool,
        honors_force: bool,
    }

    impl FakeListener {
        pub fn new(honors_stop: bool, honors_force: bool) -> Self {
            Self {
                notify: Arc::new(Notify::new()),
                honors_stop,
                honors_force,
            }
        }

        pub fn cooperative() -> Self {
            Self::new(true, true)
        }

        pub fn run(&self) -> impl Future<Output = Result<(), ListenerError>> + Send + 'static {
            let notify = Arc::clone(&self.notify);
            async move {
                notify.notified().await;
                Ok(())
            }
        }
    }

    impl ListenerControl for FakeListener {
        fn stop(&self, _deadline: Duration) -> BoxFuture<'static, Result<(), ListenerError>> {
            if self.honors_stop {
                self.notify.notify_one();
            }
            Box::pin(async { Ok(()) })
        }

        fn force_stop(&self) {
            if self.honors_force {
                self.notify.notify_one();
            }
        }
    }
}
