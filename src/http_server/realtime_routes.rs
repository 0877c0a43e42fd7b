//! Command-plane WebSocket endpoint

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::command_plane::CommandPlane;

/// `/ws`: upgrade and hand the socket to the command plane
pub fn realtime_routes(plane: Arc<CommandPlane>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(plane)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(plane): State<Arc<CommandPlane>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| plane.serve_socket(socket))
}
