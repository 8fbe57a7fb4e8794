//! Inbound interceptors used by the request pipeline.

pub mod access_log;
pub mod breaker;
pub mod canonical_host;
pub mod metrics;

pub use access_log::access_log_middleware;
pub use breaker::{breaker_middleware, BreakerRoute};
pub use canonical_host::{canonical_host_middleware, CanonicalHost};
pub use metrics::metrics_middleware;
