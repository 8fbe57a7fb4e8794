//! Per-command circuit breaker.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: command assumed broken, calls fail fast
//! - Half-Open: one trial call decides whether to close again
//!
//! # State Transitions
//! ```text
//! Closed → Open: requests >= volume threshold and error% >= threshold within the rolling window
//! Open → Half-Open: after the sleep window
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails (sleep window restarts)
//! ```
//!
//! # Design Decisions
//! - One shared state per command name, created lazily on first use
//! - Admission is a single short lock; it never waits on the wrapped work
//! - Concurrency ceiling rejects instead of queueing
//! - Rejections are counted but never feed the error percentage

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::{Response, StatusCode};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;

use crate::observability::metrics::Telemetry;
use crate::resilience::rolling::{Counts, Outcome, RollingWindow};

/// Tuning for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandConfig {
    /// Calls allowed to run at once.
    pub max_concurrent: usize,
    /// Error percentage at or above which the circuit opens.
    pub error_percent_threshold: f64,
    /// Minimum calls in the window before the error percentage is considered.
    pub request_volume_threshold: u64,
    /// How long the circuit stays open before a trial call.
    pub sleep_window: Duration,
    pub rolling_window: Duration,
    pub buckets: usize,
    /// Abandon a call that runs longer than this and count it as a failure.
    pub timeout: Option<Duration>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            error_percent_threshold: 50.0,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(10),
            buckets: 10,
            timeout: None,
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned from a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open for command {0}")]
    CircuitOpen(String),
    #[error("max concurrency reached for command {0}")]
    Saturated(String),
    #[error("command {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("command {command} answered {status}")]
    Status { command: String, status: StatusCode },
    #[error("command failed: {0}")]
    Failure(E),
}

impl<E> BreakerError<E> {
    /// Whether the wrapped work was never invoked.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen(_) | BreakerError::Saturated(_))
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            BreakerError::Failure(e) => Some(e),
            _ => None,
        }
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CircuitOpen,
    Saturated,
}

impl Rejection {
    pub fn into_error<E>(self, command: &str) -> BreakerError<E> {
        match self {
            Rejection::CircuitOpen => BreakerError::CircuitOpen(command.to_string()),
            Rejection::Saturated => BreakerError::Saturated(command.to_string()),
        }
    }
}

#[derive(Debug)]
struct CommandState {
    circuit: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    in_flight: usize,
    window: RollingWindow,
}

/// Point-in-time view of one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub error_percentage: f64,
    pub rolling: Counts,
}

/// Shared state of one named command.
#[derive(Debug)]
pub struct Command {
    name: String,
    config: CommandConfig,
    state: Mutex<CommandState>,
    telemetry: Telemetry,
}

impl Command {
    fn new(name: &str, config: CommandConfig, telemetry: Telemetry) -> Self {
        let window = RollingWindow::new(config.rolling_window, config.buckets);
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(CommandState {
                circuit: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                in_flight: 0,
                window,
            }),
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CommandState> {
        self.state.lock().expect("breaker command mutex poisoned")
    }

    pub fn state(&self) -> CircuitState {
        self.lock().circuit
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Try to admit one call.
    pub fn admit(self: &Arc<Self>) -> Result<Permit, Rejection> {
        let now = Instant::now();
        let mut state = self.lock();

        let trial = match state.circuit {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.sleep_window);
                if !cooled {
                    return Err(self.reject(&mut state, now, Rejection::CircuitOpen));
                }
                true
            }
            CircuitState::HalfOpen if state.trial_in_flight => {
                return Err(self.reject(&mut state, now, Rejection::CircuitOpen));
            }
            CircuitState::HalfOpen => true,
        };

        if state.in_flight >= self.config.max_concurrent {
            return Err(self.reject(&mut state, now, Rejection::Saturated));
        }

        if trial {
            if state.circuit == CircuitState::Open {
                state.circuit = CircuitState::HalfOpen;
                tracing::info!(target: "breaker", command = %self.name, "Circuit half-open, admitting trial call");
            }
            state.trial_in_flight = true;
        }
        state.in_flight += 1;
        drop(state);

        Ok(Permit {
            command: Arc::clone(self),
            trial,
            recorded: false,
        })
    }

    fn reject(&self, state: &mut CommandState, now: Instant, rejection: Rejection) -> Rejection {
        let outcome = match rejection {
            Rejection::CircuitOpen => Outcome::ShortCircuited,
            Rejection::Saturated => Outcome::Rejected,
        };
        state.window.record(now, outcome);
        self.telemetry.record_breaker_event(&self.name, outcome.as_str());
        rejection
    }

    fn complete(&self, trial: bool, outcome: Outcome) {
        let now = Instant::now();
        let mut state = self.lock();
        state.window.record(now, outcome);
        let failed = outcome != Outcome::Success;

        let transition = if trial {
            state.trial_in_flight = false;
            if failed {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(now);
                Some(CircuitState::Open)
            } else {
                state.circuit = CircuitState::Closed;
                state.opened_at = None;
                state.window.reset();
                Some(CircuitState::Closed)
            }
        } else if failed && state.circuit == CircuitState::Closed {
            let totals = state.window.totals(now);
            if totals.requests() >= self.config.request_volume_threshold
                && totals.error_percentage() >= self.config.error_percent_threshold
            {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(now);
                Some(CircuitState::Open)
            } else {
                None
            }
        } else {
            None
        };
        drop(state);

        self.telemetry.record_breaker_event(&self.name, outcome.as_str());
        if let Some(next) = transition {
            self.telemetry.record_breaker_open(&self.name, next != CircuitState::Closed);
            match next {
                CircuitState::Closed => tracing::info!(target: "breaker", command = %self.name, "Circuit closed"),
                _ => tracing::warn!(target: "breaker", command = %self.name, state = %next, "Circuit opened"),
            }
        }
    }

    fn release(&self, trial: bool, recorded: bool) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        // an abandoned trial lets the next caller try again
        if trial && !recorded {
            state.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> CommandSnapshot {
        let mut state = self.lock();
        let rolling = state.window.totals(Instant::now());
        CommandSnapshot {
            name: self.name.clone(),
            state: state.circuit,
            in_flight: state.in_flight,
            max_concurrent: self.config.max_concurrent,
            error_percentage: rolling.error_percentage(),
            rolling,
        }
    }
}

/// Admission ticket for one call. Dropping it releases the concurrency slot.
#[derive(Debug)]
pub struct Permit {
    command: Arc<Command>,
    trial: bool,
    recorded: bool,
}

impl Permit {
    pub fn command(&self) -> &str {
        &self.command.name
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.command.config.timeout
    }

    pub fn record(mut self, outcome: Outcome) {
        self.recorded = true;
        self.command.complete(self.trial, outcome);
    }

    pub fn success(self) {
        self.record(Outcome::Success);
    }

    pub fn failure(self) {
        self.record(Outcome::Failure);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.command.release(self.trial, self.recorded);
    }
}

/// Default fallback: log the rejection or failure and pass it on unchanged.
pub fn log_fallback<E: fmt::Display>(err: BreakerError<E>) -> BreakerError<E> {
    match &err {
        BreakerError::Failure(_) | BreakerError::Timeout { .. } | BreakerError::Status { .. } => {
            tracing::warn!(target: "breaker", error = %err, "Command failed")
        }
        _ => tracing::debug!(target: "breaker", error = %err, "Command rejected"),
    }
    err
}

/// Hook that sees every rejection or failure of a guarded call. What it
/// returns is the error the caller gets.
pub type Fallback<E> = Arc<dyn Fn(BreakerError<E>) -> BreakerError<E> + Send + Sync>;

pub fn fallback<E, F>(f: F) -> Fallback<E>
where
    F: Fn(BreakerError<E>) -> BreakerError<E> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn default_fallback<E: fmt::Display + 'static>() -> Fallback<E> {
    Arc::new(log_fallback::<E>)
}

/// Value of a guarded call that ran to completion.
#[derive(Debug)]
pub enum Guarded<T, E> {
    Success(T),
    /// The value still counts as a failure (a 5xx response). Carries what
    /// the fallback made of it.
    Degraded(T, BreakerError<E>),
}

impl<T, E> Guarded<T, E> {
    pub fn into_value(self) -> T {
        match self {
            Guarded::Success(value) | Guarded::Degraded(value, _) => value,
        }
    }

    pub fn failure(&self) -> Option<&BreakerError<E>> {
        match self {
            Guarded::Success(_) => None,
            Guarded::Degraded(_, err) => Some(err),
        }
    }
}

/// Response extension marking a response that reached the caller but was
/// counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedResponse {
    pub error: String,
}

impl<B, E: fmt::Display> Guarded<Response<B>, E> {
    /// The response, tagged with [`DegradedResponse`] when it counted as a failure.
    pub fn into_response(self) -> Response<B> {
        match self {
            Guarded::Success(response) => response,
            Guarded::Degraded(mut response, err) => {
                response.extensions_mut().insert(DegradedResponse { error: err.to_string() });
                response
            }
        }
    }
}

/// 5xx statuses count against the command.
pub fn server_error<B>(response: &Response<B>) -> Option<StatusCode> {
    Some(response.status()).filter(StatusCode::is_server_error)
}

struct RegistryInner {
    commands: DashMap<String, Arc<Command>>,
    overrides: DashMap<String, CommandConfig>,
    defaults: CommandConfig,
    telemetry: Telemetry,
}

/// All commands of one runtime, keyed by name.
#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<RegistryInner>,
}

impl BreakerRegistry {
    pub fn new(defaults: CommandConfig, telemetry: Telemetry) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                commands: DashMap::new(),
                overrides: DashMap::new(),
                defaults,
                telemetry,
            }),
        }
    }

    /// Set the configuration for `name`. Replaces an existing command's state.
    pub fn configure(&self, name: &str, config: CommandConfig) {
        self.inner.overrides.insert(name.to_string(), config.clone());
        if self.inner.commands.contains_key(name) {
            let command = Command::new(name, config, self.inner.telemetry.clone());
            self.inner.commands.insert(name.to_string(), Arc::new(command));
        }
    }

    /// The shared state for `name`, created on first use.
    pub fn command(&self, name: &str) -> Arc<Command> {
        if let Some(command) = self.inner.commands.get(name) {
            return Arc::clone(command.value());
        }
        let entry = self.inner.commands.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .inner
                .overrides
                .get(name)
                .map(|c| c.value().clone())
                .unwrap_or_else(|| self.inner.defaults.clone());
            tracing::debug!(target: "breaker", command = name, "Creating breaker command");
            Arc::new(Command::new(name, config, self.inner.telemetry.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn admit(&self, name: &str) -> Result<Permit, BreakerError<std::convert::Infallible>> {
        self.command(name).admit().map_err(|r| r.into_error(name))
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.command(name).state()
    }

    /// Every known command, sorted by name.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        let mut commands: Vec<Arc<Command>> = self.inner.commands.iter().map(|c| Arc::clone(c.value())).collect();
        commands.sort_by(|a, b| a.name().cmp(b.name()));
        commands
    }

    /// Snapshots of every known command, sorted by name.
    pub fn snapshot(&self) -> Vec<CommandSnapshot> {
        self.commands().iter().map(|c| c.snapshot()).collect()
    }

    /// Run `work` under the breaker for `name`, logging rejections and failures.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, work: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with_fallback(name, work, log_fallback).await
    }

    /// Run `work` under the breaker for `name`. `fallback` sees every
    /// rejection or failure; what it returns is what the caller gets.
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        name: &str,
        work: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(BreakerError<E>) -> BreakerError<E>,
    {
        self.guard(name, work, |_| None, fallback)
            .await
            .map(Guarded::into_value)
    }

    /// The one admission path behind every call shape.
    ///
    /// `classify` flags a finished value that still counts as a failure. A
    /// panic in `work` is recorded as a failure and then resumed.
    pub async fn guard<T, E, F, Fut, C, FB>(
        &self,
        name: &str,
        work: F,
        classify: C,
        fallback: FB,
    ) -> Result<Guarded<T, E>, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&T) -> Option<StatusCode>,
        FB: FnOnce(BreakerError<E>) -> BreakerError<E>,
    {
        let command = self.command(name);
        let permit = match command.admit() {
            Ok(permit) => permit,
            Err(rejection) => return Err(fallback(rejection.into_error(name))),
        };

        let call = AssertUnwindSafe(work()).catch_unwind();
        let finished = match permit.timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(finished) => finished,
                Err(_) => {
                    permit.record(Outcome::Timeout);
                    return Err(fallback(BreakerError::Timeout {
                        command: name.to_string(),
                        timeout: limit,
                    }));
                }
            },
            None => call.await,
        };

        match finished {
            Ok(Ok(value)) => match classify(&value) {
                Some(status) => {
                    permit.failure();
                    let err = fallback(BreakerError::Status {
                        command: name.to_string(),
                        status,
                    });
                    Ok(Guarded::Degraded(value, err))
                }
                None => {
                    permit.success();
                    Ok(Guarded::Success(value))
                }
            },
            Ok(Err(err)) => {
                permit.failure();
                Err(fallback(BreakerError::Failure(err)))
            }
            Err(payload) => {
                permit.failure();
                tracing::warn!(target: "breaker", command = name, "Command panicked");
                std::panic::resume_unwind(payload)
            }
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("commands", &self.inner.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(config: CommandConfig) -> BreakerRegistry {
        BreakerRegistry::new(config, Telemetry::new())
    }

    fn tripping_config() -> CommandConfig {
        CommandConfig {
            request_volume_threshold: 4,
            error_percent_threshold: 50.0,
            sleep_window: Duration::from_millis(100),
            ..CommandConfig::default()
        }
    }

    async fn fail(registry: &BreakerRegistry, name: &str) {
        let _ = registry.execute(name, || async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(registry: &BreakerRegistry, name: &str) {
        let _ = registry.execute(name, || async { Ok::<_, String>(()) }).await;
    }

    #[tokio::test]
    async fn opens_at_threshold_and_short_circuits() {
        let registry = registry(tripping_config());
        succeed(&registry, "db").await;
        succeed(&registry, "db").await;
        fail(&registry, "db").await;
        assert_eq!(registry.state("db"), CircuitState::Closed);
        fail(&registry, "db").await;
        assert_eq!(registry.state("db"), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let result = registry
                .execute("db", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await;
            assert!(matches!(result, Err(BreakerError::CircuitOpen(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.command("db").snapshot().rolling.short_circuited, 5);
    }

    #[tokio::test]
    async fn below_volume_threshold_never_opens() {
        let registry = registry(tripping_config());
        for _ in 0..3 {
            fail(&registry, "cache").await;
        }
        assert_eq!(registry.state("cache"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successful_trial_closes_circuit() {
        let registry = registry(tripping_config());
        for _ in 0..4 {
            fail(&registry, "svc").await;
        }
        assert_eq!(registry.state("svc"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let command = registry.command("svc");
        let trial = command.admit().unwrap();
        assert!(trial.is_trial());
        assert_eq!(command.state(), CircuitState::HalfOpen);
        assert_eq!(command.admit().unwrap_err(), Rejection::CircuitOpen);

        trial.success();
        assert_eq!(command.state(), CircuitState::Closed);
        assert_eq!(command.snapshot().rolling.requests(), 0);
        succeed(&registry, "svc").await;
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_restarts_cooldown() {
        let registry = registry(tripping_config());
        for _ in 0..4 {
            fail(&registry, "svc").await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        fail(&registry, "svc").await;
        assert_eq!(registry.state("svc"), CircuitState::Open);
        let result = registry.execute("svc", || async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen(_))));

        tokio::time::sleep(Duration::from_millis(120)).await;
        succeed(&registry, "svc").await;
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn abandoned_trial_allows_another() {
        let registry = registry(tripping_config());
        for _ in 0..4 {
            fail(&registry, "svc").await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let command = registry.command("svc");
        drop(command.admit().unwrap());
        assert_eq!(command.state(), CircuitState::HalfOpen);
        assert!(command.admit().unwrap().is_trial());
    }

    #[test]
    fn concurrency_ceiling_rejects_immediately() {
        let registry = registry(CommandConfig {
            max_concurrent: 2,
            ..CommandConfig::default()
        });
        let command = registry.command("pool");
        let first = command.admit().unwrap();
        let _second = command.admit().unwrap();
        assert_eq!(command.admit().unwrap_err(), Rejection::Saturated);
        assert_eq!(command.in_flight(), 2);

        drop(first);
        assert!(command.admit().is_ok());
        assert_eq!(command.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn saturation_applies_while_open() {
        let registry = registry(CommandConfig {
            max_concurrent: 1,
            ..tripping_config()
        });
        for _ in 0..4 {
            fail(&registry, "svc").await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        let command = registry.command("svc");
        let _held = command.admit().unwrap();
        assert!(command.admit().is_err());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let registry = registry(CommandConfig {
            timeout: Some(Duration::from_millis(20)),
            ..CommandConfig::default()
        });
        let result = registry
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(registry.command("slow").snapshot().rolling.timeouts, 1);
    }

    #[tokio::test]
    async fn fallback_result_is_returned() {
        let registry = registry(CommandConfig::default());
        let seen = AtomicUsize::new(0);
        let result: Result<(), BreakerError<String>> = registry
            .execute_with_fallback(
                "svc",
                || async { Err("upstream down".to_string()) },
                |err| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    assert!(matches!(err, BreakerError::Failure(_)));
                    BreakerError::Failure("replaced".to_string())
                },
            )
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().into_failure().as_deref(), Some("replaced"));
    }

    #[tokio::test]
    async fn degraded_value_is_returned_and_counted() {
        let registry = registry(CommandConfig::default());
        let guarded = registry
            .guard(
                "svc",
                || async { Ok::<_, String>(StatusCode::BAD_GATEWAY) },
                |status| Some(*status).filter(StatusCode::is_server_error),
                |err| {
                    assert!(matches!(err, BreakerError::Status { status: StatusCode::BAD_GATEWAY, .. }));
                    BreakerError::Failure("tagged".to_string())
                },
            )
            .await
            .unwrap();

        assert_eq!(guarded.failure().unwrap().to_string(), "command failed: tagged");
        assert_eq!(guarded.into_value(), StatusCode::BAD_GATEWAY);
        assert_eq!(registry.command("svc").snapshot().rolling.failures, 1);
    }

    #[tokio::test]
    async fn panicking_work_is_a_failure() {
        let registry = registry(CommandConfig::default());
        let handle = tokio::spawn({
            let registry = registry.clone();
            async move {
                let _ = registry
                    .execute("crashy", || async {
                        if true {
                            panic!("boom");
                        }
                        Ok::<_, String>(())
                    })
                    .await;
            }
        });

        assert!(handle.await.unwrap_err().is_panic());
        let snapshot = registry.command("crashy").snapshot();
        assert_eq!(snapshot.rolling.failures, 1);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[test]
    fn configured_commands_use_their_override() {
        let registry = registry(CommandConfig::default());
        registry.configure(
            "narrow",
            CommandConfig {
                max_concurrent: 1,
                ..CommandConfig::default()
            },
        );
        assert_eq!(registry.command("narrow").config().max_concurrent, 1);
        assert_eq!(registry.command("other").config().max_concurrent, 100);
        assert_eq!(
            registry.snapshot().iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["narrow", "other"]
        );
    }

    #[test]
    fn breaker_events_reach_metrics() {
        let registry = registry(CommandConfig {
            max_concurrent: 0,
            ..CommandConfig::default()
        });
        assert!(registry.admit("none").is_err());
        let text = registry.telemetry().render();
        assert!(text.contains("breaker_events_total{command=\"none\",outcome=\"rejected\"} 1"));
    }
}
