//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, serve loop, stop handle)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (lifecycle tracking, per-port gauges)
//!     → Hand off to the listener's router
//!
//! Connection States:
//!     New → Active ⇄ Idle → Closed
//! ```
//!
//! # Design Decisions
//! - Binding happens inside the listener task so a bind failure is reported
//!   like any other termination
//! - Each connection is tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionState, ConnectionTracker};
pub use listener::{serve, ListenerError, ServeHandle};
pub use tls::{TlsError, TlsMaterial};
