//! HTTP server for the broker.
//!
//! Provides endpoints for:
//! - Task submission, results and cancellation (`/v1/tasks`)
//! - Runner list (`/v1/runners`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::broker::Broker;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(broker: Broker) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Client API
        .route("/v1/tasks", post(handlers::submit_task))
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/result", get(handlers::await_task_result))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/v1/tasks/:id/withdraw", post(handlers::withdraw_task))
        // Status surface
        .route("/v1/runners", get(handlers::list_runners))
        .route("/v1/stats", get(handlers::stats))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(broker)
}
