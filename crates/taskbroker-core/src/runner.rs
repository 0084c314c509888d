//! Runner information types.

use crate::RunnerId;
use serde::{Deserialize, Serialize};

/// What a runner declares about itself when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInfo {
    /// Unique runner identifier.
    pub runner_id: RunnerId,

    /// Human-readable name (usually the hostname).
    pub name: String,

    /// Task types this runner can execute.
    pub task_types: Vec<String>,

    /// Maximum number of tasks the runner executes at once.
    pub max_concurrency: u32,
}

impl RunnerInfo {
    /// Create a new RunnerInfo for a JavaScript runner.
    pub fn new(runner_id: RunnerId, max_concurrency: u32) -> Self {
        Self {
            name: runner_id.to_string(),
            runner_id,
            task_types: vec![crate::DEFAULT_TASK_TYPE.to_string()],
            max_concurrency,
        }
    }

    /// Builder method to set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to replace the supported task types.
    pub fn with_task_types(mut self, task_types: Vec<String>) -> Self {
        self.task_types = task_types;
        self
    }

    /// Check if this runner executes the given task type.
    pub fn supports_task_type(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }
}
