//! Command Plane Tests
//!
//! Tests for:
//! - Versioned framing: hello, ping/pong, version and shape rejection
//! - Two-phase commands: ack before result, correlated by id
//! - At-most-once execution per command id, across connections and the
//!   HTTP facade
//! - Subscriptions filter broadcasts; sequence numbers only increase

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use dualcam::command_plane::{decode_server, AckStatus, Channel, ServerMessage};
use dualcam::config::CoordinatorConfig;
use dualcam::coordinator::Coordinator;
use dualcam::engine::{PipelineKind, SimulatedEngine};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Test Utilities
// =============================================================================

fn create_temp_data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

fn coordinator(dir: &Path) -> (Coordinator, SimulatedEngine) {
    let mut config = CoordinatorConfig::rooted_at(dir);
    config.recording.protection_seconds = 0;
    config.recording.stop_timeout_ms = 300;
    let engine = SimulatedEngine::new();
    let coordinator = Coordinator::with_engine(config, Arc::new(engine.clone())).unwrap();
    (coordinator, engine)
}

async fn serve(coordinator: &Coordinator) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = coordinator.http_server().router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn open(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_frame(ws: &mut Ws) -> ServerMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return decode_server(&text).unwrap();
        }
    }
}

/// Open a connection and consume its hello
async fn open_ready(addr: SocketAddr) -> Ws {
    let mut ws = open(addr).await;
    match next_frame(&mut ws).await {
        ServerMessage::Hello { .. } => ws,
        other => panic!("expected hello, got {:?}", other),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

// =============================================================================
// Framing
// =============================================================================

/// Every connection opens with a hello naming node and subscriptions.
#[tokio::test]
async fn test_hello_on_connect() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());
    let addr = serve(&coordinator).await;

    let mut ws = open(addr).await;
    match next_frame(&mut ws).await {
        ServerMessage::Hello {
            node_id,
            subscriptions,
            channels,
            connection_id,
        } => {
            assert_eq!(node_id, "dualcam");
            assert_eq!(subscriptions, vec![Channel::Status]);
            assert_eq!(channels, Channel::ALL.to_vec());
            assert!(!connection_id.is_empty());
        }
        other => panic!("expected hello, got {:?}", other),
    }
    assert_eq!(coordinator.metrics().snapshot().connections_opened, 1);
}

/// Ping echoes its nonce.
#[tokio::test]
async fn test_ping_pong() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());
    let mut ws = open_ready(serve(&coordinator).await).await;

    send(&mut ws, json!({"v": 1, "type": "ping", "nonce": 7})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Pong { nonce, server_time } => {
            assert_eq!(nonce, Some(7));
            assert!(server_time > 0);
        }
        other => panic!("expected pong, got {:?}", other),
    }
}

/// Wrong or missing version is rejected; the connection stays usable.
#[tokio::test]
async fn test_version_mismatch_rejected() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());
    let mut ws = open_ready(serve(&coordinator).await).await;

    send(&mut ws, json!({"v": 2, "type": "ping"})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_version"),
        other => panic!("expected error, got {:?}", other),
    }

    send(&mut ws, json!({"type": "ping"})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_version"),
        other => panic!("expected error, got {:?}", other),
    }

    send(&mut ws, json!({"v": 1, "type": "ping", "nonce": 1})).await;
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerMessage::Pong { nonce: Some(1), .. }
    ));
}

/// Unparseable frames and unknown types are invalid messages.
#[tokio::test]
async fn test_malformed_frames_rejected() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());
    let mut ws = open_ready(serve(&coordinator).await).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    match next_frame(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_message"),
        other => panic!("expected error, got {:?}", other),
    }

    send(&mut ws, json!({"v": 1, "type": "teleport"})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_message"),
        other => panic!("expected error, got {:?}", other),
    }

    send(&mut ws, json!({"v": 1, "type": "command", "id": " ", "action": "status.get"})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_message"),
        other => panic!("expected error, got {:?}", other),
    }
}

// =============================================================================
// Commands
// =============================================================================

/// A command is acknowledged, then answered under the same id.
#[tokio::test]
async fn test_command_ack_then_result() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());
    let mut ws = open_ready(serve(&coordinator).await).await;

    send(
        &mut ws,
        json!({"v": 1, "type": "command", "id": "q-1", "action": "status.get"}),
    )
    .await;

    match next_frame(&mut ws).await {
        ServerMessage::CommandAck { id, status } => {
            assert_eq!(id, "q-1");
            assert_eq!(status, AckStatus::Received);
        }
        other => panic!("expected ack, got {:?}", other),
    }
    match next_frame(&mut ws).await {
        ServerMessage::CommandResult { id, outcome } => {
            assert_eq!(id, "q-1");
            assert!(outcome.success);
            assert_eq!(outcome.data.unwrap()["node_id"], "dualcam");
        }
        other => panic!("expected result, got {:?}", other),
    }
}

/// Unknown actions and bad params fail as validation errors.
#[tokio::test]
async fn test_command_validation_errors() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, engine) = coordinator(temp_dir.path());
    let mut ws = open_ready(serve(&coordinator).await).await;

    send(
        &mut ws,
        json!({"v": 1, "type": "command", "id": "bad-1", "action": "camera.explode"}),
    )
    .await;
    send(
        &mut ws,
        json!({"v": 1, "type": "command", "id": "bad-2", "action": "recording.start",
               "params": {"session_id": "m1", "colour": "red"}}),
    )
    .await;

    let mut results = Vec::new();
    while results.len() < 2 {
        if let ServerMessage::CommandResult { id, outcome } = next_frame(&mut ws).await {
            results.push((id, outcome));
        }
    }
    for (id, outcome) in results {
        assert!(!outcome.success, "{} should fail", id);
        assert_eq!(outcome.error.unwrap().code, "validation_error");
    }
    assert_eq!(engine.start_calls(), 0);
}

/// The same command id on a second connection returns the cached outcome
/// without executing again or acknowledging.
#[tokio::test]
async fn test_duplicate_id_across_connections_executes_once() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, engine) = coordinator(temp_dir.path());
    let addr = serve(&coordinator).await;
    let command = json!({"v": 1, "type": "command", "id": "rec-1",
                         "action": "recording.start", "params": {"session_id": "m1"}});

    let mut first = open_ready(addr).await;
    send(&mut first, command.clone()).await;
    let first_outcome = loop {
        if let ServerMessage::CommandResult { outcome, .. } = next_frame(&mut first).await {
            break outcome;
        }
    };
    assert!(first_outcome.success);
    let calls = engine.start_calls();
    drop(first);

    let mut second = open_ready(addr).await;
    send(&mut second, command).await;
    match next_frame(&mut second).await {
        ServerMessage::CommandResult { id, outcome } => {
            assert_eq!(id, "rec-1");
            assert_eq!(outcome, first_outcome);
        }
        other => panic!("cached duplicate must answer with the result, got {:?}", other),
    }

    assert_eq!(engine.start_calls(), calls);
    assert_eq!(coordinator.metrics().snapshot().duplicate_commands, 1);
}

/// A duplicate that arrives while the original still runs waits for it.
#[tokio::test]
async fn test_in_flight_duplicate_shares_outcome() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, engine) = coordinator(temp_dir.path());
    let executor = Arc::clone(coordinator.executor());

    coordinator
        .recording()
        .start(Some("m1".to_string()), false)
        .await;
    engine.hang_on_stop(0);

    let mut acks = Vec::new();
    let (original, duplicate) = tokio::join!(
        executor.submit(Some("stop-1"), "recording.stop", Value::Null, |_| {}),
        executor.submit(Some("stop-1"), "recording.stop", Value::Null, |status| {
            acks.push(status)
        }),
    );

    assert_eq!(original, duplicate);
    assert_eq!(acks, vec![AckStatus::Processing]);
    assert_eq!(coordinator.metrics().snapshot().duplicate_commands, 1);
    assert!(engine.running(PipelineKind::Recording).len() <= 1);
}

// =============================================================================
// Broadcasts
// =============================================================================

/// Subscribed channels are delivered with increasing seq; unsubscribed
/// channels are not.
#[tokio::test]
async fn test_subscription_filters_broadcasts() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());
    let broadcaster = Arc::clone(coordinator.plane().broadcaster());
    let mut ws = open_ready(serve(&coordinator).await).await;

    send(&mut ws, json!({"v": 1, "type": "subscribe", "channels": ["metrics"]})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Subscribed { channels } => {
            assert_eq!(channels, vec![Channel::Status, Channel::Metrics]);
        }
        other => panic!("expected subscribed, got {:?}", other),
    }

    broadcaster.publish(Channel::Metrics, json!({"n": 1}));
    broadcaster.publish(Channel::Metrics, json!({"n": 2}));
    let mut seqs = Vec::new();
    while seqs.len() < 2 {
        if let ServerMessage::Broadcast { channel, seq, .. } = next_frame(&mut ws).await {
            assert_eq!(channel, Channel::Metrics);
            seqs.push(seq);
        }
    }
    assert!(seqs[1] > seqs[0]);

    send(&mut ws, json!({"v": 1, "type": "unsubscribe", "channels": ["metrics"]})).await;
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerMessage::Subscribed { .. }
    ));
    broadcaster.publish(Channel::Metrics, json!({"n": 3}));
    send(&mut ws, json!({"v": 1, "type": "ping", "nonce": 9})).await;
    match next_frame(&mut ws).await {
        ServerMessage::Pong { nonce, .. } => assert_eq!(nonce, Some(9)),
        other => panic!("unsubscribed channel leaked: {:?}", other),
    }
}

// =============================================================================
// HTTP Facade
// =============================================================================

/// The facade shares the idempotency cache with the command plane.
#[tokio::test]
async fn test_facade_idempotency_key() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, engine) = coordinator(temp_dir.path());

    let request = || post("/api/recording/start", Some("http-1"), json!({"session_id": "m1"}));

    let first = coordinator
        .http_server()
        .router()
        .oneshot(request())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first = body_json(first).await;
    assert_eq!(first["command_id"], "http-1");
    assert_eq!(first["success"], true);
    let calls = engine.start_calls();

    let second = coordinator
        .http_server()
        .router()
        .oneshot(request())
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await, first);
    assert_eq!(engine.start_calls(), calls);
}

/// Conflicts and validation errors map to their HTTP statuses.
#[tokio::test]
async fn test_facade_error_statuses() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());

    let started = coordinator
        .http_server()
        .router()
        .oneshot(post("/api/recording/start", None, json!({"session_id": "m1"})))
        .await
        .unwrap();
    assert_eq!(started.status(), StatusCode::OK);

    let conflict = coordinator
        .http_server()
        .router()
        .oneshot(post("/api/preview/start", None, json!({"camera_id": 0})))
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    let body = body_json(conflict).await;
    assert_eq!(body["error"]["code"], "resource_conflict");
    assert_eq!(body["data"]["holder"], "dualcam:recording");

    let invalid = coordinator
        .http_server()
        .router()
        .oneshot(post("/api/preview/start", None, json!({"camera_id": 9})))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

/// Read-only endpoints answer without side effects.
#[tokio::test]
async fn test_facade_reads() {
    let temp_dir = create_temp_data_dir();
    let (coordinator, _engine) = coordinator(temp_dir.path());

    let health = coordinator
        .http_server()
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["status"], "ok");

    let lock = coordinator
        .http_server()
        .router()
        .oneshot(Request::get("/api/lock").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(lock.status(), StatusCode::OK);
    assert_eq!(body_json(lock).await["data"]["mode"], "idle");

    let logs = coordinator
        .http_server()
        .router()
        .oneshot(Request::get("/api/logs?limit=x").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(logs.status(), StatusCode::BAD_REQUEST);
}
