//! The service runtime: starts the configured listeners, supervises them and
//! drives shutdown.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;

use crate::config::loader::ConfigError;
use crate::config::options::{RuntimeConfig, ServerOption};
use crate::http::server::{metrics_router, rpc_router, service_pipeline};
use crate::lifecycle::signals::{spawn_external_watcher, spawn_interrupt_watcher};
use crate::lifecycle::supervisor::{event_channel, ListenerSupervisor};
use crate::lifecycle::{
    EventSource, ShutdownCoordinator, ShutdownPolicy, ShutdownReport, TaskGroup,
};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{serve, ServeHandle};
use crate::net::tls::TlsMaterial;
use crate::observability::metrics::Telemetry;
use crate::resilience::circuit_breaker::{BreakerRegistry, CommandConfig};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("bind address {0:?} is not an IP address")]
    BindAddress(String),
}

struct ContextInner {
    service_name: String,
    telemetry: Telemetry,
    breakers: BreakerRegistry,
    connections: ConnectionTracker,
    tasks: TaskGroup,
    started_at: Instant,
}

/// Shared state handed to every component: metrics, breakers, connection
/// tracking and the task group. Replaces process-wide registries.
#[derive(Clone)]
pub struct RuntimeContext {
    inner: Arc<ContextInner>,
}

impl RuntimeContext {
    pub fn new(service_name: impl Into<String>, tasks: TaskGroup, breaker_defaults: CommandConfig) -> Self {
        let telemetry = Telemetry::new();
        Self {
            inner: Arc::new(ContextInner {
                service_name: service_name.into(),
                breakers: BreakerRegistry::new(breaker_defaults, telemetry.clone()),
                connections: ConnectionTracker::new(telemetry.clone()),
                telemetry,
                tasks,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.inner.connections
    }

    pub fn tasks(&self) -> &TaskGroup {
        &self.inner.tasks
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("service_name", &self.inner.service_name)
            .field("breakers", &self.inner.breakers)
            .field("tasks", &self.inner.tasks.count())
            .field("uptime", &self.uptime())
            .finish()
    }
}

/// A configured service, ready to run.
#[derive(Debug)]
pub struct ServiceRuntime {
    config: RuntimeConfig,
    ctx: RuntimeContext,
}

impl ServiceRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let tasks = config
            .shutdown
            .as_ref()
            .map(|external| external.tasks.clone())
            .unwrap_or_default();
        let ctx = RuntimeContext::new(config.service_name(), tasks, config.breaker_defaults.clone());
        Self::with_context(config, ctx)
    }

    /// Run on a context built up front, so handlers can share its breakers
    /// and task group. The context keeps its own breaker defaults; configured
    /// per-command overrides are applied to it.
    pub fn with_context(config: RuntimeConfig, ctx: RuntimeContext) -> Self {
        for (name, command) in &config.breaker_commands {
            ctx.breakers().configure(name, command.clone());
        }
        Self { config, ctx }
    }

    pub fn from_options(options: impl IntoIterator<Item = ServerOption>) -> Result<Self, RuntimeError> {
        Ok(Self::new(RuntimeConfig::from_options(options)?))
    }

    /// Shared state; clone it before `run` to reach the breakers or metrics
    /// from handlers.
    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start every enabled listener and block until shutdown completes.
    ///
    /// The caller turns the report into the process exit code.
    pub async fn run(self) -> Result<ShutdownReport, RuntimeError> {
        let ServiceRuntime { config, ctx } = self;
        let RuntimeConfig {
            settings,
            plain,
            rpc,
            metrics,
            tls,
            interceptors,
            shutdown,
            ..
        } = config;

        let ip: IpAddr = settings
            .bind_address
            .parse()
            .map_err(|_| RuntimeError::BindAddress(settings.bind_address.clone()))?;
        let secure = tls.is_some();
        let mut supervisor = ListenerSupervisor::new(ctx.tasks().clone());
        let mut launched: Vec<String> = Vec::new();

        if let Some(router) = plain {
            let addr = SocketAddr::new(ip, settings.plain_port);
            let router = service_pipeline("plainListener", &settings, &interceptors, secure, &ctx).wrap(router);
            register(&mut supervisor, EventSource::PlainListener, addr, router, tls.clone(), &ctx);
            launched.push(format!("plain:{}", settings.plain_port));
        }

        if let Some(registration) = rpc {
            let addr = SocketAddr::new(ip, settings.rpc_port);
            let pipeline = service_pipeline("rpcListener", &settings, &interceptors, secure, &ctx);
            let handle = ServeHandle::new();
            let control = handle.clone();
            let tracker = ctx.connections().clone();
            let material = tls.clone();
            supervisor.register_listener(
                EventSource::RpcListener,
                async move {
                    let router = pipeline.wrap(rpc_router(registration)?);
                    serve(addr, router, material, handle, tracker).await
                },
                control,
            );
            launched.push(format!("rpc:{}", settings.rpc_port));
        }

        if let Some(routes) = metrics {
            let addr = SocketAddr::new(ip, settings.metrics_port);
            let router = metrics_router(routes, &ctx);
            register(&mut supervisor, EventSource::MetricsListener, addr, router, None, &ctx);
            launched.push(format!("metrics:{}", settings.metrics_port));
        }

        tracing::info!(
            service = %ctx.service_name(),
            listeners = %launched.join(","),
            insecure = !secure,
            "Launching service"
        );

        let (events_tx, events_rx) = event_channel();
        let listeners = supervisor.start(&events_tx);
        let watcher = match shutdown {
            Some(external) => spawn_external_watcher(external.signal, events_tx.clone(), ctx.tasks()),
            None => spawn_interrupt_watcher(events_tx.clone(), ctx.tasks()),
        };
        drop(events_tx);

        let policy = ShutdownPolicy {
            deadline: settings.shutdown_deadline(),
            grace: settings.shutdown_grace(),
        };
        let report = ShutdownCoordinator::new(policy, listeners, events_rx, ctx.tasks().clone())
            .run()
            .await;
        watcher.abort();

        if tokio::time::timeout(policy.grace, ctx.tasks().join()).await.is_err() {
            tracing::warn!(remaining = ctx.tasks().count(), "Tasks still running after shutdown");
        }
        tracing::info!(
            outcome = report.outcome.as_str(),
            exit_code = report.exit_code(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Service stopped"
        );
        Ok(report)
    }
}

fn register(
    supervisor: &mut ListenerSupervisor,
    source: EventSource,
    addr: SocketAddr,
    router: Router,
    tls: Option<TlsMaterial>,
    ctx: &RuntimeContext,
) {
    let handle = ServeHandle::new();
    let control = handle.clone();
    let tracker = ctx.connections().clone();
    supervisor.register_listener(source, serve(addr, router, tls, handle, tracker), control);
}
