//! Option functions and the frozen runtime configuration.
//!
//! Options are applied in order to a mutable [`RuntimeConfigBuilder`];
//! [`RuntimeConfigBuilder::build`] validates the result and freezes it into a
//! [`RuntimeConfig`] that nothing can change afterwards.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use futures_util::future::BoxFuture;

use crate::config::loader::ConfigError;
use crate::config::schema::{RuntimeSettings, TlsSettings};
use crate::config::validation::{validate_ports, validate_settings};
use crate::http::pipeline::Interceptor;
use crate::lifecycle::TaskGroup;
use crate::net::tls::TlsMaterial;
use crate::resilience::circuit_breaker::CommandConfig;
use crate::security::rate_limit::RateLimitKey;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Registers the RPC endpoints on the router the runtime hands over.
pub type RpcRegistration = Box<dyn FnOnce(Router) -> Result<Router, BoxError> + Send>;

/// One named configuration step.
pub type ServerOption = Box<dyn FnOnce(&mut RuntimeConfigBuilder) -> Result<(), ConfigError> + Send>;

/// A caller-owned shutdown trigger. The runtime registers its tasks in
/// `tasks`, so the caller can join it after firing `signal`.
pub struct ExternalShutdown {
    pub signal: BoxFuture<'static, ()>,
    pub tasks: TaskGroup,
}

/// Mutable configuration while options are applied.
pub struct RuntimeConfigBuilder {
    settings: RuntimeSettings,
    plain: Option<Router>,
    rpc: Option<RpcRegistration>,
    metrics: Option<Router>,
    tls_config: Option<RustlsConfig>,
    interceptors: Vec<Interceptor>,
    shutdown: Option<ExternalShutdown>,
    breaker_defaults: CommandConfig,
    breaker_commands: BTreeMap<String, CommandConfig>,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::from_settings(RuntimeSettings::default())
    }

    /// Start from file-backed settings.
    pub fn from_settings(settings: RuntimeSettings) -> Self {
        let breaker_defaults = settings.breaker.defaults.to_command_config();
        let breaker_commands = settings
            .breaker
            .commands
            .iter()
            .map(|(name, c)| (name.clone(), c.to_command_config()))
            .collect();
        Self {
            settings,
            plain: None,
            rpc: None,
            metrics: None,
            tls_config: None,
            interceptors: Vec::new(),
            shutdown: None,
            breaker_defaults,
            breaker_commands,
        }
    }

    /// Apply `options` in order. The first failing option aborts.
    pub fn apply(mut self, options: impl IntoIterator<Item = ServerOption>) -> Result<Self, ConfigError> {
        for option in options {
            option(&mut self)?;
        }
        Ok(self)
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let mut errors = validate_settings(&self.settings).err().unwrap_or_default();

        let mut enabled = Vec::new();
        if self.plain.is_some() {
            enabled.push(("plainListener", self.settings.plain_port));
        }
        if self.rpc.is_some() {
            enabled.push(("rpcListener", self.settings.rpc_port));
        }
        if self.metrics.is_some() {
            enabled.push(("metricsListener", self.settings.metrics_port));
        }
        if let Err(port_errors) = validate_ports(&enabled) {
            errors.extend(port_errors);
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        let tls = match (self.tls_config, &self.settings.tls) {
            (Some(config), _) => Some(TlsMaterial::Config(config)),
            (
                None,
                Some(TlsSettings {
                    cert_path: Some(cert_path),
                    key_path: Some(key_path),
                }),
            ) => Some(TlsMaterial::Files {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };

        Ok(RuntimeConfig {
            settings: self.settings,
            plain: self.plain,
            rpc: self.rpc,
            metrics: self.metrics,
            tls,
            interceptors: self.interceptors,
            shutdown: self.shutdown,
            breaker_defaults: self.breaker_defaults,
            breaker_commands: self.breaker_commands,
        })
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable configuration consumed by the runtime.
pub struct RuntimeConfig {
    pub(crate) settings: RuntimeSettings,
    pub(crate) plain: Option<Router>,
    pub(crate) rpc: Option<RpcRegistration>,
    pub(crate) metrics: Option<Router>,
    pub(crate) tls: Option<TlsMaterial>,
    pub(crate) interceptors: Vec<Interceptor>,
    pub(crate) shutdown: Option<ExternalShutdown>,
    pub(crate) breaker_defaults: CommandConfig,
    pub(crate) breaker_commands: BTreeMap<String, CommandConfig>,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Build from default settings and `options`.
    pub fn from_options(options: impl IntoIterator<Item = ServerOption>) -> Result<Self, ConfigError> {
        RuntimeConfigBuilder::new().apply(options)?.build()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn service_name(&self) -> &str {
        &self.settings.service_name
    }

    pub fn plain_enabled(&self) -> bool {
        self.plain.is_some()
    }

    pub fn rpc_enabled(&self) -> bool {
        self.rpc.is_some()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }

    /// No TLS material configured.
    pub fn insecure(&self) -> bool {
        self.tls.is_none()
    }

    pub fn has_external_shutdown(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn breaker_defaults(&self) -> &CommandConfig {
        &self.breaker_defaults
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("settings", &self.settings)
            .field("plain", &self.plain_enabled())
            .field("rpc", &self.rpc_enabled())
            .field("metrics", &self.metrics_enabled())
            .field("tls", &self.tls)
            .field("interceptors", &self.interceptors.len())
            .field("external_shutdown", &self.has_external_shutdown())
            .finish()
    }
}

fn option<F>(f: F) -> ServerOption
where
    F: FnOnce(&mut RuntimeConfigBuilder) -> Result<(), ConfigError> + Send + 'static,
{
    Box::new(f)
}

/// Serve `router` on the plain request/response listener.
pub fn with_plain_listener(router: Router) -> ServerOption {
    option(move |b| {
        b.plain = Some(router);
        Ok(())
    })
}

/// Enable the RPC listener; `register` adds the endpoints.
pub fn with_rpc_listener<F>(register: F) -> ServerOption
where
    F: FnOnce(Router) -> Result<Router, BoxError> + Send + 'static,
{
    option(move |b| {
        b.rpc = Some(Box::new(register));
        Ok(())
    })
}

/// Enable the metrics listener. `router` answers every path the listener
/// does not serve itself (typically the health endpoints).
pub fn with_metrics_listener(router: Router) -> ServerOption {
    option(move |b| {
        b.metrics = Some(router);
        Ok(())
    })
}

pub fn with_plain_listen_port(port: u16) -> ServerOption {
    option(move |b| {
        b.settings.plain_port = port;
        Ok(())
    })
}

pub fn with_rpc_listen_port(port: u16) -> ServerOption {
    option(move |b| {
        b.settings.rpc_port = port;
        Ok(())
    })
}

pub fn with_metrics_listen_port(port: u16) -> ServerOption {
    option(move |b| {
        b.settings.metrics_port = port;
        Ok(())
    })
}

pub fn with_bind_address(address: impl Into<String>) -> ServerOption {
    let address = address.into();
    option(move |b| {
        b.settings.bind_address = address;
        Ok(())
    })
}

/// Serve TLS from PEM certificate and key files.
pub fn with_certificate(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> ServerOption {
    let cert_path = cert_path.into();
    let key_path = key_path.into();
    option(move |b| {
        b.settings.tls = Some(TlsSettings {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        });
        Ok(())
    })
}

/// Serve TLS with a prepared rustls configuration; wins over certificate files.
pub fn with_tls_config(config: RustlsConfig) -> ServerOption {
    option(move |b| {
        b.tls_config = Some(config);
        Ok(())
    })
}

pub fn with_compression() -> ServerOption {
    option(|b| {
        b.settings.compression = true;
        Ok(())
    })
}

/// Redirect requests for any other host to `host` (308).
pub fn with_canonical_host(host: impl Into<String>) -> ServerOption {
    let host = host.into();
    option(move |b| {
        if host.trim().is_empty() {
            return Err(ConfigError::Option("canonical host must not be empty".into()));
        }
        b.settings.canonical_host = Some(host);
        Ok(())
    })
}

pub fn with_service_name(name: impl Into<String>) -> ServerOption {
    let name = name.into();
    option(move |b| {
        b.settings.service_name = name;
        Ok(())
    })
}

/// Shut down when `signal` resolves instead of on OS signals. Runtime tasks
/// are registered in `tasks`.
pub fn with_shutdown_signal<F>(signal: F, tasks: TaskGroup) -> ServerOption
where
    F: Future<Output = ()> + Send + 'static,
{
    option(move |b| {
        b.shutdown = Some(ExternalShutdown {
            signal: Box::pin(signal),
            tasks,
        });
        Ok(())
    })
}

/// Append interceptors to the plain and RPC pipelines, innermost last.
pub fn with_interceptors(interceptors: impl IntoIterator<Item = Interceptor>) -> ServerOption {
    let interceptors: Vec<Interceptor> = interceptors.into_iter().collect();
    option(move |b| {
        b.interceptors.extend(interceptors);
        Ok(())
    })
}

/// Enable a global token bucket of `rate` per second and `burst` capacity.
pub fn with_rate_limit(rate: f64, burst: u32) -> ServerOption {
    with_rate_limit_keyed(rate, burst, RateLimitKey::Global)
}

pub fn with_rate_limit_keyed(rate: f64, burst: u32, key: RateLimitKey) -> ServerOption {
    option(move |b| {
        if rate <= 0.0 || burst == 0 {
            return Err(ConfigError::Option(format!(
                "rate limit needs a positive rate and burst (got {rate}/{burst})"
            )));
        }
        b.settings.rate_limit.enabled = true;
        b.settings.rate_limit.requests_per_second = rate;
        b.settings.rate_limit.burst = burst;
        b.settings.rate_limit.key = key;
        Ok(())
    })
}

pub fn with_shutdown_deadline(deadline: Duration) -> ServerOption {
    option(move |b| {
        b.settings.shutdown_deadline_secs = deadline.as_secs().max(1);
        Ok(())
    })
}

pub fn with_shutdown_grace(grace: Duration) -> ServerOption {
    option(move |b| {
        b.settings.shutdown_grace_secs = grace.as_secs();
        Ok(())
    })
}

pub fn with_request_timeout(timeout: Duration) -> ServerOption {
    option(move |b| {
        b.settings.request_timeout_secs = timeout.as_secs();
        Ok(())
    })
}

/// Configuration for every command without an override.
pub fn with_breaker_defaults(config: CommandConfig) -> ServerOption {
    option(move |b| {
        b.breaker_defaults = config;
        Ok(())
    })
}

pub fn with_breaker_command(name: impl Into<String>, config: CommandConfig) -> ServerOption {
    let name = name.into();
    option(move |b| {
        b.breaker_commands.insert(name, config);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validation::ValidationError;

    #[test]
    fn options_apply_in_order() {
        let config = RuntimeConfig::from_options(vec![
            with_plain_listen_port(9000),
            with_plain_listen_port(9001),
            with_service_name("echo"),
            with_compression(),
            with_canonical_host("www.example.com"),
        ])
        .unwrap();

        assert_eq!(config.settings().plain_port, 9001);
        assert_eq!(config.service_name(), "echo");
        assert!(config.settings().compression);
        assert_eq!(config.settings().canonical_host.as_deref(), Some("www.example.com"));
        assert!(config.insecure());
        assert!(!config.plain_enabled());
    }

    #[test]
    fn failing_option_aborts() {
        let err = RuntimeConfig::from_options(vec![with_canonical_host("  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Option(_)));
        let err = RuntimeConfig::from_options(vec![with_rate_limit(0.0, 10)]).unwrap_err();
        assert!(matches!(err, ConfigError::Option(_)));
    }

    #[test]
    fn enabled_listeners_must_not_share_ports() {
        let err = RuntimeConfig::from_options(vec![
            with_plain_listener(Router::new()),
            with_metrics_listener(Router::new()),
            with_plain_listen_port(7000),
            with_metrics_listen_port(7000),
        ])
        .unwrap_err();

        match err {
            ConfigError::Validation(errors) => {
                assert!(matches!(errors[0], ValidationError::DuplicatePort { port: 7000, .. }))
            }
            other => panic!("unexpected error: {other}"),
        }

        // same port is fine while only one of them is enabled
        assert!(RuntimeConfig::from_options(vec![
            with_plain_listener(Router::new()),
            with_plain_listen_port(7000),
            with_metrics_listen_port(7000),
        ])
        .is_ok());
    }

    #[test]
    fn certificate_files_become_tls_material() {
        let config = RuntimeConfig::from_options(vec![with_certificate("cert.pem", "key.pem")]).unwrap();
        assert!(!config.insecure());
        assert!(matches!(config.tls, Some(TlsMaterial::Files { .. })));
    }

    #[test]
    fn breaker_options_override_settings() {
        let mut settings = RuntimeSettings::default();
        settings.breaker.defaults.max_concurrent = 7;
        let config = RuntimeConfigBuilder::from_settings(settings)
            .apply(vec![with_breaker_command(
                "payments",
                CommandConfig {
                    max_concurrent: 3,
                    ..CommandConfig::default()
                },
            )])
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.breaker_defaults().max_concurrent, 7);
        assert_eq!(config.breaker_commands["payments"].max_concurrent, 3);
    }
}
