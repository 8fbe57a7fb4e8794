//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, summaries on a local recorder)
//!
//! Consumers (metrics listener):
//!     → /metrics       Prometheus text from metrics.rs
//!     → /hystrix       breaker_stream.rs (SSE, one record per command)
//!     → /debug/vars    debug_vars.rs (JSON runtime state)
//! ```
//!
//! # Design Decisions
//! - Structured logging (pretty or JSON) for machine parsing
//! - Request ID rides on the `request` span
//! - No global metrics recorder; each runtime owns its own

pub mod breaker_stream;
pub mod debug_vars;
pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::Telemetry;
