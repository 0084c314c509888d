//! Task Broker Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network transports
//! - Async runtimes
//! - Storage
//!
//! Both the broker and the runner build on these types; the wire protocol
//! between them lives in [`protocol`].

pub mod error;
pub mod guard;
pub mod ids;
pub mod protocol;
pub mod runner;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::{CoreError, TaskError, TaskRejectError};
pub use guard::ModuleGuard;
pub use ids::{RunnerId, TaskId};
pub use protocol::{BrokerMessage, RunnerMessage};
pub use runner::RunnerInfo;
pub use status::TaskStatus;
pub use task::{terminal_status, Task, TaskOutcome, TaskPayload, DEFAULT_TASK_TYPE};
