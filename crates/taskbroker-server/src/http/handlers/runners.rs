//! Runner list and broker statistics.

use axum::{extract::State, response::IntoResponse, Json};

use crate::broker::Broker;
use crate::http::responses::RunnerResponse;

/// List connected runners, in registration order.
pub async fn list_runners(State(broker): State<Broker>) -> impl IntoResponse {
    let response: Vec<RunnerResponse> = broker
        .runners()
        .await
        .into_iter()
        .map(|r| RunnerResponse {
            runner_id: r.runner_id.to_string(),
            name: r.name,
            task_types: r.task_types,
            max_concurrency: r.max_concurrency,
            in_flight: r.in_flight,
            tasks: r.tasks.iter().map(|t| t.to_string()).collect(),
            registered_at: r.registered_at.to_rfc3339(),
            last_heartbeat: r.last_heartbeat_at.to_rfc3339(),
            suspect: r.suspect,
        })
        .collect();
    Json(response)
}

pub async fn stats(State(broker): State<Broker>) -> impl IntoResponse {
    Json(broker.stats().await)
}
