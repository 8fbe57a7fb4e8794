//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RuntimeSettings
//!
//! RuntimeSettings + [ServerOption]
//!     → options.rs (apply in order, validate ports, resolve TLS)
//!     → RuntimeConfig (immutable, consumed by the runtime)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once built; there is no reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Options are plain boxed closures; the first failing one aborts

pub mod loader;
pub mod options;
pub mod schema;
pub mod validation;

pub use loader::{load_settings, parse_settings, ConfigError};
pub use options::*;
pub use schema::{LogFormat, LoggingSettings, RuntimeSettings};
pub use validation::ValidationError;
