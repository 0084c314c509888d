//! Core domain errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RunnerId;

/// Core domain errors for the task broker.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Why a task did not produce a result.
///
/// This is what a client receives from `await_result`. User-code failures
/// (`DisallowedModule`, `Execution`) are distinct from infrastructure
/// failures (`RunnerLost`) and from `Timeout`, so the client can decide
/// whether resubmitting makes sense.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// User code imported a module the guard rejected.
    #[error("Module '{module}' is disallowed")]
    DisallowedModule { module: String },

    /// User code threw, or the sandbox failed to run it.
    #[error("Task execution failed: {message}")]
    Execution {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    /// The runner executing the task disconnected or failed its heartbeat check.
    #[error("Runner {runner_id} was lost while executing the task")]
    RunnerLost { runner_id: RunnerId },

    /// The task exceeded its deadline.
    #[error("Task timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The task was cancelled.
    #[error("Task cancelled: {reason}")]
    Cancelled { reason: String },

    /// The caller gave up on a task still waiting for runner capacity.
    #[error("Task was withdrawn while waiting for a runner")]
    Deferred,
}

impl TaskError {
    /// Build an execution error without a stack trace.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            stack: None,
        }
    }

    /// Infrastructure failures are worth resubmitting; user-code failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RunnerLost { .. })
    }
}

/// A runner declined an offered task.
///
/// Never surfaced to clients: the broker re-offers the task instead.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Task rejected: {reason}")]
pub struct TaskRejectError {
    pub reason: String,
}

impl TaskRejectError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
