//! One-shot request facade
//!
//! Request/response equivalents of the command-plane actions for clients
//! without a live channel. Every handler goes through the same
//! `CommandExecutor` as the WebSocket path; a `command_id` in the body (or
//! an `Idempotency-Key` header) shares the same idempotency cache.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::command_plane::{CommandOutcome, CommandPlane};
use crate::errors::ErrorKind;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Serialize)]
pub struct FacadeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
}

type FacadeResult = (StatusCode, Json<FacadeResponse>);

/// Routes mounted under `/api`
pub fn command_routes(plane: Arc<CommandPlane>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/lock", get(lock_handler))
        .route("/logs", get(logs_handler))
        .route("/health", get(health_report_handler))
        .route("/recording/start", post(recording_start_handler))
        .route("/recording/stop", post(recording_stop_handler))
        .route("/preview/start", post(preview_start_handler))
        .route("/preview/stop", post(preview_stop_handler))
        .route("/preview/restart", post(preview_restart_handler))
        .with_state(plane)
}

/// HTTP status for an outcome
pub fn status_for(outcome: &CommandOutcome) -> StatusCode {
    if outcome.success {
        return StatusCode::OK;
    }
    let code = outcome
        .error
        .as_ref()
        .and_then(|e| ErrorKind::from_code(&e.code))
        .map(|kind| kind.status_code())
        .unwrap_or(500);
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn respond(command_id: Option<String>, outcome: CommandOutcome) -> FacadeResult {
    (
        status_for(&outcome),
        Json(FacadeResponse {
            command_id,
            outcome,
        }),
    )
}

/// Parse the body and pull the command id out of it or the header.
///
/// An empty body means no params.
pub fn split_command(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Option<String>, Value), CommandOutcome> {
    let mut params = if body.iter().all(|b| b.is_ascii_whitespace()) {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(body).map_err(|e| {
            CommandOutcome::failed(
                ErrorKind::Validation.code(),
                format!("request body is not valid JSON: {}", e),
            )
        })?
    };

    let mut command_id = None;
    if let Value::Object(map) = &mut params {
        match map.remove("command_id") {
            Some(Value::String(id)) => command_id = Some(id),
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(CommandOutcome::failed(
                    ErrorKind::Validation.code(),
                    "command_id must be a string",
                ))
            }
        }
        if map.is_empty() {
            params = Value::Null;
        }
    }

    if command_id.is_none() {
        command_id = headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }

    Ok((command_id, params))
}

async fn run_action(plane: &CommandPlane, action: &str, headers: &HeaderMap, body: &[u8]) -> FacadeResult {
    let (command_id, params) = match split_command(headers, body) {
        Ok(parts) => parts,
        Err(outcome) => return respond(None, outcome),
    };
    let outcome = plane
        .executor()
        .submit(command_id.as_deref(), action, params, |_| {})
        .await;
    respond(command_id, outcome)
}

async fn status_handler(State(plane): State<Arc<CommandPlane>>) -> FacadeResult {
    respond(None, plane.executor().execute("status.get", Value::Null).await)
}

async fn lock_handler(State(plane): State<Arc<CommandPlane>>) -> FacadeResult {
    respond(None, plane.executor().execute("lock.get", Value::Null).await)
}

async fn health_report_handler(State(plane): State<Arc<CommandPlane>>) -> FacadeResult {
    respond(None, plane.executor().execute("health.get", Value::Null).await)
}

async fn logs_handler(
    State(plane): State<Arc<CommandPlane>>,
    Query(query): Query<HashMap<String, String>>,
) -> FacadeResult {
    let params = match query.get("limit") {
        None => Value::Null,
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) => json!({ "limit": limit }),
            Err(_) => {
                return respond(
                    None,
                    CommandOutcome::failed(
                        ErrorKind::Validation.code(),
                        format!("limit must be a non-negative integer, got '{}'", raw),
                    ),
                )
            }
        },
    };
    respond(None, plane.executor().execute("logs.get", params).await)
}

async fn recording_start_handler(
    State(plane): State<Arc<CommandPlane>>,
    headers: HeaderMap,
    body: Bytes,
) -> FacadeResult {
    run_action(&plane, "recording.start", &headers, &body).await
}

async fn recording_stop_handler(
    State(plane): State<Arc<CommandPlane>>,
    headers: HeaderMap,
    body: Bytes,
) -> FacadeResult {
    run_action(&plane, "recording.stop", &headers, &body).await
}

async fn preview_start_handler(
    State(plane): State<Arc<CommandPlane>>,
    headers: HeaderMap,
    body: Bytes,
) -> FacadeResult {
    run_action(&plane, "preview.start", &headers, &body).await
}

async fn preview_stop_handler(
    State(plane): State<Arc<CommandPlane>>,
    headers: HeaderMap,
    body: Bytes,
) -> FacadeResult {
    run_action(&plane, "preview.stop", &headers, &body).await
}

async fn preview_restart_handler(
    State(plane): State<Arc<CommandPlane>>,
    headers: HeaderMap,
    body: Bytes,
) -> FacadeResult {
    run_action(&plane, "preview.restart", &headers, &body).await
}
