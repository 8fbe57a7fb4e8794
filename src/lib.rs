//! Service runtime: runs a plain, an RPC and a metrics listener in one
//! process, supervises them and shuts them down within a deadline.

pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod runtime;
pub mod security;

pub use config::{RuntimeConfig, RuntimeConfigBuilder, ServerOption};
pub use lifecycle::{ShutdownOutcome, ShutdownReport, TaskGroup};
pub use runtime::{RuntimeContext, RuntimeError, ServiceRuntime};
