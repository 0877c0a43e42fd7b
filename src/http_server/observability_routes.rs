//! Health and metrics endpoints

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::command_plane::CommandPlane;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
}

/// `/health` and `/metrics` at the root
pub fn health_routes(plane: Arc<CommandPlane>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(plane)
}

async fn health_handler(State(plane): State<Arc<CommandPlane>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: plane.executor().node_id().to_string(),
    };

    (StatusCode::OK, Json(response))
}

async fn metrics_handler(State(plane): State<Arc<CommandPlane>>) -> impl IntoResponse {
    (StatusCode::OK, Json(plane.executor().metrics().snapshot()))
}
