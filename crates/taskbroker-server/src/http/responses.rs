//! HTTP request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use taskbroker_core::{Task, TaskError, TaskOutcome, TaskPayload, DEFAULT_TASK_TYPE};

use crate::error::BrokerError;

// ============================================================================
// Task types
// ============================================================================

fn default_client() -> String {
    "http".to_string()
}

fn default_task_type() -> String {
    DEFAULT_TASK_TYPE.to_string()
}

/// Request body for task submission.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    /// Reference to the submitting workflow execution.
    #[serde(default = "default_client")]
    pub client: String,

    #[serde(default = "default_task_type")]
    pub task_type: String,

    pub code: String,

    #[serde(default)]
    pub input: serde_json::Value,

    #[serde(default)]
    pub allowed_modules: Vec<String>,

    /// Execution time limit; the broker default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SubmitTaskRequest {
    pub fn payload(&self) -> TaskPayload {
        TaskPayload {
            task_type: self.task_type.clone(),
            code: self.code.clone(),
            input: self.input.clone(),
            allowed_modules: self.allowed_modules.clone(),
        }
    }
}

/// Response body for task submission.
#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

/// Request body for cancellation.
#[derive(Debug, Default, Deserialize)]
pub struct CancelTaskRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// A task's outcome as sent to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeResponse {
    Ok { result: serde_json::Value },
    Error { error: TaskError, retryable: bool },
}

impl From<TaskOutcome> for OutcomeResponse {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            Ok(result) => Self::Ok { result },
            Err(error) => Self::Error {
                retryable: error.is_retryable(),
                error,
            },
        }
    }
}

/// Task snapshot.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub client: String,
    pub task_type: String,
    pub status: String,
    pub runner_id: Option<String>,
    pub created_at: String,
    pub deadline: Option<String>,
    pub outcome: Option<OutcomeResponse>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            client: task.client,
            task_type: task.payload.task_type,
            status: task.status.as_str().to_string(),
            runner_id: task.runner_id.map(|r| r.to_string()),
            created_at: task.created_at.to_rfc3339(),
            deadline: task.deadline.map(|d| d.to_rfc3339()),
            outcome: task.outcome.map(OutcomeResponse::from),
        }
    }
}

// ============================================================================
// Runner types
// ============================================================================

/// Response for a single runner.
#[derive(Debug, Serialize)]
pub struct RunnerResponse {
    pub runner_id: String,
    pub name: String,
    pub task_types: Vec<String>,
    pub max_concurrency: u32,
    pub in_flight: u32,
    pub tasks: Vec<String>,
    pub registered_at: String,
    pub last_heartbeat: String,
    pub suspect: bool,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A broker error on its way to an HTTP client.
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::TaskNotFound(_) | BrokerError::RunnerNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidStateTransition { .. }
            | BrokerError::NotAssigned { .. }
            | BrokerError::DuplicateRunner(_) => StatusCode::CONFLICT,
            BrokerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            BrokerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
