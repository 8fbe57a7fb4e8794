//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (net)
//!     → pipeline.rs (fixed interceptor chain per listener)
//!         → request.rs (correlation id, request context)
//!         → response.rs (status / length capture)
//!         → middleware/ (metrics, access log, canonical host, breaker)
//!     → caller's handler
//!
//! server.rs builds the router of each listener kind.
//! ```

pub mod middleware;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod server;

pub use pipeline::{interceptor, Interceptor, Pipeline};
pub use request::{RequestContext, RequestContextExt, X_REMOTE_USER, X_REQUEST_ID};
pub use response::ResponseCapture;
