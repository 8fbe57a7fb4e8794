//! Configuration schema definitions.
//!
//! This module defines the file-backed part of the runtime configuration.
//! All types derive Serde traits for deserialization from config files, and
//! every field has a default so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::CommandConfig;
use crate::security::rate_limit::RateLimitKey;

/// Root settings for the service runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Name used in logs and the launch record.
    pub service_name: String,

    /// Address every listener binds to (e.g., "0.0.0.0").
    pub bind_address: String,

    /// Port of the plain request/response listener.
    pub plain_port: u16,

    /// Port of the RPC listener.
    pub rpc_port: u16,

    /// Port of the metrics / health listener.
    pub metrics_port: u16,

    /// Gzip responses on the plain and RPC listeners.
    pub compression: bool,

    /// Redirect requests for any other host here.
    pub canonical_host: Option<String>,

    /// Certificate and key files; both or neither.
    pub tls: Option<TlsSettings>,

    /// Time listeners get to stop before being forced.
    pub shutdown_deadline_secs: u64,

    /// Time force-stopped listeners get before shutdown is declared unclean.
    pub shutdown_grace_secs: u64,

    /// Per-request timeout on the plain and RPC listeners; 0 disables it.
    pub request_timeout_secs: u64,

    /// Request body limit on the plain and RPC listeners.
    pub max_body_bytes: usize,

    pub rate_limit: RateLimitSettings,

    pub breaker: BreakerSettings,

    pub logging: LoggingSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            bind_address: "0.0.0.0".to_string(),
            plain_port: 8443,
            rpc_port: 50050,
            metrics_port: 8080,
            compression: false,
            canonical_host: None,
            tls: None,
            shutdown_deadline_secs: 60,
            shutdown_grace_secs: 1,
            request_timeout_secs: 30,
            max_body_bytes: 2 * 1024 * 1024,
            rate_limit: RateLimitSettings::default(),
            breaker: BreakerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// TLS files for the plain and RPC listeners.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsSettings {
    /// Path to certificate file (PEM).
    pub cert_path: Option<PathBuf>,

    /// Path to private key file (PEM).
    pub key_path: Option<PathBuf>,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Enable rate limiting on the plain and RPC listeners.
    pub enabled: bool,

    /// Tokens added per second.
    pub requests_per_second: f64,

    /// Bucket capacity.
    pub burst: u32,

    /// One bucket per listener, or per client IP.
    pub key: RateLimitKey,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 100.0,
            burst: 50,
            key: RateLimitKey::Global,
        }
    }
}

/// Circuit breaker tuning for one command.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandSettings {
    pub max_concurrent: usize,
    pub error_percent_threshold: f64,
    pub request_volume_threshold: u64,
    pub sleep_window_ms: u64,
    pub rolling_window_ms: u64,
    pub buckets: usize,
    pub timeout_ms: Option<u64>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        CommandSettings::from(&CommandConfig::default())
    }
}

impl From<&CommandConfig> for CommandSettings {
    fn from(config: &CommandConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            error_percent_threshold: config.error_percent_threshold,
            request_volume_threshold: config.request_volume_threshold,
            sleep_window_ms: config.sleep_window.as_millis() as u64,
            rolling_window_ms: config.rolling_window.as_millis() as u64,
            buckets: config.buckets,
            timeout_ms: config.timeout.map(|t| t.as_millis() as u64),
        }
    }
}

impl CommandSettings {
    pub fn to_command_config(&self) -> CommandConfig {
        CommandConfig {
            max_concurrent: self.max_concurrent,
            error_percent_threshold: self.error_percent_threshold,
            request_volume_threshold: self.request_volume_threshold,
            sleep_window: Duration::from_millis(self.sleep_window_ms),
            rolling_window: Duration::from_millis(self.rolling_window_ms),
            buckets: self.buckets,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Defaults for every command plus per-command overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    #[serde(flatten)]
    pub defaults: CommandSettings,

    /// Overrides keyed by command name.
    pub commands: BTreeMap<String, CommandSettings>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset (e.g., "info").
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings: RuntimeSettings = toml::from_str("").unwrap();
        assert_eq!(settings.plain_port, 8443);
        assert_eq!(settings.rpc_port, 50050);
        assert_eq!(settings.metrics_port, 8080);
        assert_eq!(settings.shutdown_deadline(), Duration::from_secs(60));
        assert_eq!(settings.breaker.defaults.max_concurrent, 100);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn breaker_overrides_parse() {
        let settings: RuntimeSettings = toml::from_str(
            r#"
            [breaker]
            max_concurrent = 10

            [breaker.commands.payments]
            error_percent_threshold = 25.0
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.breaker.defaults.max_concurrent, 10);
        let payments = settings.breaker.commands["payments"].to_command_config();
        assert_eq!(payments.error_percent_threshold, 25.0);
        assert_eq!(payments.timeout, Some(Duration::from_millis(250)));
        assert_eq!(payments.sleep_window, Duration::from_secs(5));
    }

    #[test]
    fn zero_request_timeout_disables_it() {
        let settings = RuntimeSettings {
            request_timeout_secs: 0,
            ..RuntimeSettings::default()
        };
        assert_eq!(settings.request_timeout(), None);
    }
}
