//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Guarded call (outbound client, transport hook, inbound handler):
//!     → circuit_breaker.rs (admit: circuit state + concurrency ceiling)
//!     → the wrapped work, bounded by the optional command timeout
//!     → rolling.rs (record outcome in the per-command window)
//!     → circuit_breaker.rs (open / close the circuit on the new totals)
//! ```
//!
//! # Design Decisions
//! - One shared state per command name, whatever the call shape
//! - Rejections never run the wrapped work and never wait
//! - Every call shape goes through `BreakerRegistry::guard`; a 5xx response
//!   is a failure but still reaches the caller, tagged `DegradedResponse`
//! - Each shape takes an optional fallback; its result is what the caller sees

pub mod circuit_breaker;
pub mod client;
pub mod layer;
pub mod rolling;

pub use circuit_breaker::{
    default_fallback, fallback, log_fallback, BreakerError, BreakerRegistry, CircuitState, CommandConfig,
    CommandSnapshot, DegradedResponse, Fallback, Guarded, Permit,
};
pub use client::{BreakerClient, ClientError};
pub use layer::{CircuitBreakerLayer, CircuitBreakerService};
pub use rolling::{Counts, Outcome};
