//! Client task API.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use taskbroker_core::TaskId;

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::http::responses::{
    ApiError, CancelTaskRequest, OutcomeResponse, SubmitTaskRequest, SubmitTaskResponse,
    TaskResponse,
};

/// Submit a task. Returns as soon as the task is offered or deferred.
pub async fn submit_task(
    State(broker): State<Broker>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = req.timeout_ms.map(Duration::from_millis);
    let task_id = broker.submit(&req.client, req.payload(), deadline).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitTaskResponse {
            task_id: task_id.to_string(),
        }),
    ))
}

pub async fn get_task(
    State(broker): State<Broker>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::new(id);
    let task = broker
        .task(&task_id)
        .await
        .ok_or(BrokerError::TaskNotFound(task_id))?;
    Ok(Json(TaskResponse::from(task)))
}

/// Long-poll for a task's outcome.
pub async fn await_task_result(
    State(broker): State<Broker>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = broker.await_result(&TaskId::new(id)).await?;
    Ok(Json(OutcomeResponse::from(outcome)))
}

pub async fn cancel_task(
    State(broker): State<Broker>,
    Path(id): Path<String>,
    body: Option<Json<CancelTaskRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "cancelled by client".to_string());
    broker.cancel(&TaskId::new(id), &reason).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Stop waiting for a deferred task.
pub async fn withdraw_task(
    State(broker): State<Broker>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    broker.withdraw(&TaskId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
