//! Broker errors.

use thiserror::Error;

use taskbroker_core::{CoreError, RunnerId, TaskId, TaskStatus};

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Runner already registered: {0}")]
    DuplicateRunner(RunnerId),

    #[error("Runner not found: {0}")]
    RunnerNotFound(RunnerId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task_id} cannot go from {from} to {to}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id} is not assigned to runner {runner_id}")]
    NotAssigned { task_id: TaskId, runner_id: RunnerId },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Broker is shutting down")]
    Closed,
}

impl From<CoreError> for BrokerError {
    fn from(err: CoreError) -> Self {
        BrokerError::InvalidInput(err.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors on a runner connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<CoreError> for TransportError {
    fn from(err: CoreError) -> Self {
        TransportError::Protocol(err.to_string())
    }
}
