//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (token bucket per listener or per client IP)
//!     → over capacity: 429, inner handler never runs
//! ```
//!
//! # Design Decisions
//! - Buckets start full: a burst is admitted straight away
//! - Fail closed: an empty bucket rejects

pub mod rate_limit;

pub use rate_limit::{rate_limit_middleware, RateLimitKey, RateLimiter, RateLimiterState};
