//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (deadline > 0, thresholds within (0, 100])
//! - Detect port clashes between enabled listeners
//! - Reject half-specified TLS material
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function over the settings

use std::collections::HashMap;

use crate::config::schema::{CommandSettings, RuntimeSettings};
use crate::resilience::rolling::MAX_BUCKETS;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("listeners {first} and {second} both use port {port}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("shutdown deadline must be greater than zero")]
    ZeroShutdownDeadline,
    #[error("rate limit requests_per_second must be greater than zero")]
    ZeroRateLimitRate,
    #[error("rate limit burst must be greater than zero")]
    ZeroRateLimitBurst,
    #[error("breaker command {command}: {reason}")]
    Breaker { command: String, reason: String },
    #[error("TLS needs both cert_path and key_path")]
    IncompleteTls,
    #[error("invalid log filter {directive:?}: {reason}")]
    LogLevel { directive: String, reason: String },
    #[error("bind address {0:?} is not an IP address")]
    BindAddress(String),
}

/// Check everything that does not depend on which listeners are enabled.
pub fn validate_settings(settings: &RuntimeSettings) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if settings.bind_address.parse::<std::net::IpAddr>().is_err() {
        errors.push(ValidationError::BindAddress(settings.bind_address.clone()));
    }

    if settings.shutdown_deadline_secs == 0 {
        errors.push(ValidationError::ZeroShutdownDeadline);
    }

    if settings.rate_limit.enabled {
        if settings.rate_limit.requests_per_second <= 0.0 {
            errors.push(ValidationError::ZeroRateLimitRate);
        }
        if settings.rate_limit.burst == 0 {
            errors.push(ValidationError::ZeroRateLimitBurst);
        }
    }

    check_command("default", &settings.breaker.defaults, &mut errors);
    for (name, command) in &settings.breaker.commands {
        check_command(name, command, &mut errors);
    }

    if let Some(tls) = &settings.tls {
        if tls.cert_path.is_some() != tls.key_path.is_some() {
            errors.push(ValidationError::IncompleteTls);
        }
    }

    if let Err(e) = tracing_subscriber::EnvFilter::try_new(&settings.logging.level) {
        errors.push(ValidationError::LogLevel {
            directive: settings.logging.level.clone(),
            reason: e.to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Ports must be distinct among the listeners that will actually bind.
/// Port 0 (ephemeral) never clashes.
pub fn validate_ports(enabled: &[(&str, u16)]) -> Result<(), Vec<ValidationError>> {
    let mut seen: HashMap<u16, &str> = HashMap::new();
    let mut errors = Vec::new();
    for (name, port) in enabled {
        if *port == 0 {
            continue;
        }
        if let Some(first) = seen.insert(*port, *name) {
            errors.push(ValidationError::DuplicatePort {
                port: *port,
                first: first.to_string(),
                second: name.to_string(),
            });
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_command(name: &str, command: &CommandSettings, errors: &mut Vec<ValidationError>) {
    let mut fail = |reason: &str| {
        errors.push(ValidationError::Breaker {
            command: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if !(command.error_percent_threshold > 0.0 && command.error_percent_threshold <= 100.0) {
        fail("error_percent_threshold must be within (0, 100]");
    }
    if command.max_concurrent == 0 {
        fail("max_concurrent must be greater than zero");
    }
    if command.buckets == 0 || command.buckets > MAX_BUCKETS {
        fail(&format!("buckets must be between 1 and {MAX_BUCKETS}"));
    }
    if command.rolling_window_ms == 0 {
        fail("rolling_window_ms must be greater than zero");
    }
    if command.timeout_ms == Some(0) {
        fail("timeout_ms must be greater than zero when set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsSettings;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_settings(&RuntimeSettings::default()).is_ok());
    }

    #[test]
    fn all_problems_are_reported() {
        let mut settings = RuntimeSettings {
            shutdown_deadline_secs: 0,
            tls: Some(TlsSettings {
                cert_path: Some("cert.pem".into()),
                key_path: None,
            }),
            ..RuntimeSettings::default()
        };
        settings.rate_limit.enabled = true;
        settings.rate_limit.burst = 0;
        settings.breaker.defaults.error_percent_threshold = 150.0;

        let errors = validate_settings(&settings).unwrap_err();
        assert!(errors.contains(&ValidationError::ZeroShutdownDeadline));
        assert!(errors.contains(&ValidationError::ZeroRateLimitBurst));
        assert!(errors.contains(&ValidationError::IncompleteTls));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::Breaker { command, .. } if command == "default")));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let errors = validate_ports(&[("plainListener", 8080), ("metricsListener", 8080), ("rpcListener", 0)])
            .unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicatePort {
                port: 8080,
                first: "plainListener".into(),
                second: "metricsListener".into(),
            }]
        );
        assert!(validate_ports(&[("a", 0), ("b", 0)]).is_ok());
    }

    #[test]
    fn oversized_bucket_counts_are_rejected() {
        let mut settings = RuntimeSettings::default();
        settings.breaker.commands.insert(
            "wide".to_string(),
            CommandSettings {
                buckets: usize::MAX,
                ..CommandSettings::default()
            },
        );

        let errors = validate_settings(&settings).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::Breaker {
                command: "wide".into(),
                reason: "buckets must be between 1 and 1000".into(),
            }]
        );
    }
}
