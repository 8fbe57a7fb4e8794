//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor (supervisor.rs):
//!     register listeners → start → one task per listener
//!     listener task ends → Event{source, err} → event channel
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM/SIGQUIT → Event{interrupt} → event channel
//!     external shutdown future → Event{unknown} → event channel
//!
//! Shutdown (shutdown.rs):
//!     first Event → stop every other running listener (deadline)
//!     → wait for their Events → Clean
//!     → deadline elapsed → force stop → grace → SoftTimeout | HardTimeout
//! ```
//!
//! # Design Decisions
//! - Message passing only: listeners never touch coordinator state
//! - Every task holds a TaskGroup guard for its whole life
//! - Library code never exits the process; the outcome carries the exit code

pub mod event;
pub mod shutdown;
pub mod signals;
pub mod supervisor;
pub mod task_group;

pub use event::{Event, EventError, EventSource};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownPolicy, ShutdownReport};
pub use supervisor::{ListenerControl, ListenerHandle, ListenerSupervisor};
pub use task_group::{TaskGroup, TaskGuard};
