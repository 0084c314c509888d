//! Task Runner Library
//!
//! Connects to a task broker, accepts offered tasks up to a configured
//! concurrency, and executes them behind the module allow-list guard.

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod imports;

pub use config::Config;
pub use connection::RunnerConnection;
pub use error::RunnerError;
pub use executor::{ExecutionOutcome, Executor, ExecutorError, NodeExecutor, TaskRequest};
