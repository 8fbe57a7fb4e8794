//! Shutdown coordination.
//!
//! The coordinator waits for the first [`Event`], then asks every other
//! running listener to stop and waits for their follow-up events within a
//! deadline. Past the deadline the stragglers are force-stopped and given a
//! short grace period; the outcome of that race decides the exit code.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::lifecycle::event::{Event, EventSource};
use crate::lifecycle::supervisor::{EventReceiver, ListenerHandle};
use crate::lifecycle::task_group::TaskGroup;

/// Deadline and grace period for one shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub deadline: Duration,
    pub grace: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            grace: Duration::from_secs(1),
        }
    }
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    ShuttingDown,
    Terminated,
}

/// How shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every listener acknowledged within the deadline.
    Clean,
    /// The deadline passed, force-stopped listeners reported within the grace period.
    SoftTimeout,
    /// Listeners were still outstanding after deadline plus grace.
    HardTimeout,
}

impl ShutdownOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Clean => 0,
            ShutdownOutcome::SoftTimeout => 1,
            ShutdownOutcome::HardTimeout => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::Clean => "clean",
            ShutdownOutcome::SoftTimeout => "soft-timeout",
            ShutdownOutcome::HardTimeout => "hard-timeout",
        }
    }
}

/// Summary handed back to whoever decides the process exit code.
#[derive(Debug)]
pub struct ShutdownReport {
    /// The event that started shutdown.
    pub trigger: Event,
    pub outcome: ShutdownOutcome,
    /// Listeners that never reported.
    pub unresolved: Vec<EventSource>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Consumes the event stream and drives shutdown of all listeners.
pub struct ShutdownCoordinator {
    policy: ShutdownPolicy,
    listeners: Vec<ListenerHandle>,
    events: EventReceiver,
    tasks: TaskGroup,
    state: CoordinatorState,
}

impl ShutdownCoordinator {
    pub fn new(
        policy: ShutdownPolicy,
        listeners: Vec<ListenerHandle>,
        events: EventReceiver,
        tasks: TaskGroup,
    ) -> Self {
        Self {
            policy,
            listeners,
            events,
            tasks,
            state: CoordinatorState::Running,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Wait for a termination event and shut everything down.
    pub async fn run(mut self) -> ShutdownReport {
        let trigger = match self.events.recv().await {
            Some(event) => event,
            None => Event::clean(EventSource::Unknown),
        };
        self.shutdown(trigger).await
    }

    /// Shut down every running listener except the one `trigger` came from.
    pub async fn shutdown(&mut self, trigger: Event) -> ShutdownReport {
        let started = Instant::now();
        self.state = CoordinatorState::ShuttingDown;
        match &trigger.err {
            Some(err) => tracing::info!(source = %trigger.source, error = %err, "Termination event detected"),
            None => tracing::info!(source = %trigger.source, "Termination event detected"),
        }

        let mut awaited = HashSet::new();
        for listener in &self.listeners {
            let source = listener.source();
            if source == trigger.source || !listener.is_running() {
                continue;
            }
            awaited.insert(source);

            let stop = listener.stop(self.policy.deadline);
            self.tasks.spawn("listener-stop", async move {
                if let Err(err) = stop.await {
                    tracing::error!(source = %source, error = %err, "Listener stop failed");
                }
            });
        }
        tracing::debug!(wait_events = awaited.len(), "Waiting for listeners to stop");

        let outcome = if self.drain(&mut awaited, self.policy.deadline).await {
            ShutdownOutcome::Clean
        } else {
            tracing::warn!(
                outstanding = awaited.len(),
                deadline_secs = self.policy.deadline.as_secs_f64(),
                "Wait time for listener shutdown has elapsed, forcing stop"
            );
            self.force_stop(&awaited);
            if self.drain(&mut awaited, self.policy.grace).await {
                ShutdownOutcome::SoftTimeout
            } else {
                tracing::error!(outstanding = awaited.len(), "Listeners did not stop, shutdown is unclean");
                ShutdownOutcome::HardTimeout
            }
        };

        self.state = CoordinatorState::Terminated;
        let mut unresolved: Vec<_> = awaited.into_iter().collect();
        unresolved.sort();
        tracing::info!(outcome = outcome.as_str(), "Server shutdown complete");

        ShutdownReport {
            trigger,
            outcome,
            unresolved,
            elapsed: started.elapsed(),
        }
    }

    /// Consume follow-up events until nothing is awaited or `budget` runs out.
    /// Returns whether every awaited listener reported.
    async fn drain(&mut self, awaited: &mut HashSet<EventSource>, budget: Duration) -> bool {
        let events = &mut self.events;
        let listeners = &self.listeners;

        let wait = async {
            while !awaited.is_empty() {
                let Some(event) = events.recv().await else {
                    return;
                };
                match event.source {
                    EventSource::Interrupt | EventSource::Unknown => {
                        tracing::warn!(source = %event.source, "Repeated shutdown request, forcing stop");
                        for listener in listeners.iter().filter(|l| awaited.contains(&l.source())) {
                            listener.force_stop();
                        }
                    }
                    source => {
                        awaited.remove(&source);
                        match &event.err {
                            Some(err) => tracing::info!(source = %source, error = %err, "Listener shutdown notice received"),
                            None => tracing::info!(source = %source, "Listener shutdown notice received"),
                        }
                        tracing::debug!(wait_events = awaited.len(), "Listener shutdown");
                    }
                }
            }
        };

        tokio::time::timeout(budget, wait).await.is_ok()
    }

    fn force_stop(&self, awaited: &HashSet<EventSource>) {
        for listener in self.listeners.iter().filter(|l| awaited.contains(&l.source())) {
            tracing::warn!(source = %listener.source(), "Force-stopping listener");
            listener.force_stop();
        }
    }
}
