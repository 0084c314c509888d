//! Task types.

use crate::{CoreError, RunnerId, TaskError, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task type used when a submission does not name one.
pub const DEFAULT_TASK_TYPE: &str = "javascript";

/// What a client gets back for a task: the script's return value or why it failed.
pub type TaskOutcome = Result<serde_json::Value, TaskError>;

/// The code to run and the data it runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Which kind of runner can execute this (e.g. "javascript").
    #[serde(default = "default_task_type")]
    pub task_type: String,

    /// Script source.
    pub code: String,

    /// Input items handed to the script.
    #[serde(default)]
    pub input: serde_json::Value,

    /// Modules the script may import. Empty means the runner's own allow-list applies.
    #[serde(default)]
    pub allowed_modules: Vec<String>,
}

/// Terminal status an outcome leads to.
pub fn terminal_status(outcome: &TaskOutcome) -> TaskStatus {
    match outcome {
        Ok(_) => TaskStatus::Succeeded,
        Err(TaskError::Cancelled { .. }) | Err(TaskError::Deferred) => TaskStatus::Cancelled,
        Err(_) => TaskStatus::Failed,
    }
}

fn default_task_type() -> String {
    DEFAULT_TASK_TYPE.to_string()
}

impl TaskPayload {
    /// Create a JavaScript payload with no input.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            task_type: default_task_type(),
            code: code.into(),
            input: serde_json::Value::Null,
            allowed_modules: Vec::new(),
        }
    }

    /// Builder method to set the input data.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Builder method to set the task type.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Builder method to add an allowed module.
    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.allowed_modules.push(module.into());
        self
    }

    /// Reject payloads no runner could do anything with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.code.trim().is_empty() {
            return Err(CoreError::InvalidInput("task code is empty".to_string()));
        }
        if self.task_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("task type is empty".to_string()));
        }
        Ok(())
    }
}

/// A unit of sandboxed code execution, as seen from outside the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Who submitted this task (workflow execution reference).
    pub client: String,

    /// What to run.
    pub payload: TaskPayload,

    /// Current task status.
    pub status: TaskStatus,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// Wall-clock deadline, if any.
    pub deadline: Option<DateTime<Utc>>,

    /// Runner the task is offered to or executing on.
    pub runner_id: Option<RunnerId>,

    /// Set once the task is terminal.
    pub outcome: Option<TaskOutcome>,
}

impl Task {
    /// Create a new Task in `Pending`.
    pub fn new(client: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            id: TaskId::generate(),
            client: client.into(),
            payload,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            deadline: None,
            runner_id: None,
            outcome: None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, refusing anything the transition table forbids.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Enter a terminal state and record the outcome.
    pub fn finish(&mut self, outcome: TaskOutcome) -> Result<(), CoreError> {
        self.transition(terminal_status(&outcome))?;
        self.outcome = Some(outcome);
        Ok(())
    }
}
