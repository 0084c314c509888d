//! Health and metrics handlers.

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::broker::Broker;

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(broker): State<Broker>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&broker).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
