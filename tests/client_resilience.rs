//! Command Plane Client Resilience Tests
//!
//! Tests for:
//! - A half-open channel (socket up, nothing received) trips the receive
//!   watchdog and forces a reconnect
//! - After reconnecting the client restores its subscriptions unprompted
//! - Commands without a result are resent under the same id
//! - End-to-end against a live coordinator

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use dualcam::command_plane::{
    decode_client, encode, Channel, ClientEvent, ClientMessage, ClientSettings, CommandOutcome,
    CommandPlaneClient, ServerMessage,
};
use dualcam::config::CoordinatorConfig;
use dualcam::coordinator::Coordinator;

// =============================================================================
// Test Utilities
// =============================================================================

/// Text frames received, one list per accepted connection
type FrameLog = Arc<Mutex<Vec<Vec<String>>>>;

fn fast_settings(addr: SocketAddr) -> ClientSettings {
    let mut settings = ClientSettings::new(format!("ws://{}/ws", addr));
    settings.reconnect_base = Duration::from_millis(20);
    settings.reconnect_max = Duration::from_millis(100);
    settings.receive_timeout = Duration::from_millis(300);
    settings
}

/// Accept connections, record what arrives, never answer.
async fn spawn_silent_server() -> (SocketAddr, FrameLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: FrameLog = Arc::new(Mutex::new(Vec::new()));

    let accept_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = {
                let mut log = accept_log.lock().unwrap();
                log.push(Vec::new());
                log.len() - 1
            };
            let conn_log = Arc::clone(&accept_log);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        conn_log.lock().unwrap()[index].push(text);
                    }
                }
            });
        }
    });

    (addr, log)
}

fn frames(log: &FrameLog, connection: usize) -> Vec<ClientMessage> {
    log.lock()
        .unwrap()
        .get(connection)
        .map(|frames| frames.iter().filter_map(|t| decode_client(t).ok()).collect())
        .unwrap_or_default()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Half-Open Channel
// =============================================================================

/// Silence past the receive window forces a reconnect, and the new
/// connection resubscribes to the prior channel set.
#[tokio::test]
async fn test_silent_server_forces_reconnect_and_resubscribe() {
    let (addr, log) = spawn_silent_server().await;
    let mut settings = fast_settings(addr);
    settings.subscriptions = vec![Channel::Status, Channel::Metrics];
    let client = CommandPlaneClient::connect(settings);
    let mut events = client.events();

    wait_until("second connection", || client.connections() >= 2).await;
    assert!(client.watchdog_fires() >= 1);

    wait_until("resubscribe on second connection", || {
        frames(&log, 1)
            .iter()
            .any(|f| matches!(f, ClientMessage::Subscribe { .. }))
    })
    .await;
    let resubscribed = frames(&log, 1)
        .into_iter()
        .find_map(|f| match f {
            ClientMessage::Subscribe { channels } => Some(channels),
            _ => None,
        })
        .unwrap();
    assert_eq!(resubscribed, vec![Channel::Status, Channel::Metrics]);

    // The client kept pinging while it waited.
    assert!(frames(&log, 0)
        .iter()
        .any(|f| matches!(f, ClientMessage::Ping { .. })));

    let mut saw_watchdog = false;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Disconnected { reason } = event {
            saw_watchdog |= reason == dualcam::command_plane::DisconnectReason::Watchdog;
        }
    }
    assert!(saw_watchdog);

    client.shutdown().await;
}

/// Subscriptions changed at runtime are what gets restored.
#[tokio::test]
async fn test_resubscribe_uses_current_set() {
    let (addr, log) = spawn_silent_server().await;
    let client = CommandPlaneClient::connect(fast_settings(addr));

    wait_until("first connection", || client.connections() >= 1).await;
    client.subscribe(&[Channel::Health]).unwrap();
    client.unsubscribe(&[Channel::Status]).unwrap();
    assert_eq!(client.subscriptions(), vec![Channel::Health]);

    wait_until("second connection", || client.connections() >= 2).await;
    wait_until("resubscribe", || !frames(&log, 1).is_empty()).await;
    let first_on_reconnect = frames(&log, 1).into_iter().next().unwrap();
    assert_eq!(
        first_on_reconnect,
        ClientMessage::Subscribe {
            channels: vec![Channel::Health]
        }
    );

    client.shutdown().await;
}

// =============================================================================
// Command Resend
// =============================================================================

/// A command whose result never arrived is resent under the same id on the
/// next connection, and its eventual result resolves the original call.
#[tokio::test]
async fn test_unanswered_command_resent_with_same_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let server_seen = Arc::clone(&seen);
    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            connection += 1;
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let Ok(ClientMessage::Command { id, .. }) = decode_client(&text) else {
                    continue;
                };
                server_seen.lock().unwrap().push(id.clone());
                if connection == 1 {
                    // Drop the first connection with the command unanswered.
                    break;
                }
                let reply = ServerMessage::CommandResult {
                    id,
                    outcome: CommandOutcome::ok(json!({"answered_on": connection})),
                };
                ws.send(Message::Text(encode(&reply).unwrap())).await.unwrap();
            }
        }
    });

    let client = CommandPlaneClient::connect(fast_settings(addr));
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.command_with_id("cmd-42", "status.get", Value::Null),
    )
    .await
    .expect("command never resolved")
    .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.data.unwrap()["answered_on"], 2);
    let seen = seen.lock().unwrap().clone();
    assert!(seen.len() >= 2);
    assert!(seen.iter().all(|id| id == "cmd-42"));

    client.shutdown().await;
}

/// Shutting down fails whatever is still pending instead of hanging.
#[tokio::test]
async fn test_shutdown_fails_pending() {
    let (addr, _log) = spawn_silent_server().await;
    let client = Arc::new(CommandPlaneClient::connect(fast_settings(addr)));

    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.command("status.get", Value::Null).await })
    };
    wait_until("first connection", || client.connections() >= 1).await;
    client.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
}

// =============================================================================
// Live Coordinator
// =============================================================================

/// Client and server agree end to end: commands, hello and broadcasts.
#[tokio::test]
async fn test_client_against_live_coordinator() {
    let temp_dir = TempDir::new().unwrap();
    let coordinator = Coordinator::build(CoordinatorConfig::rooted_at(temp_dir.path())).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = coordinator.http_server().router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = CommandPlaneClient::connect(ClientSettings::new(format!("ws://{}/ws", addr)));
    let mut events = client.events();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.command("lock.get", Value::Null),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.data.unwrap()["mode"], "idle");

    client.subscribe(&[Channel::Metrics]).unwrap();
    let broadcaster = Arc::clone(coordinator.plane().broadcaster());
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            // Publish until the subscribe has landed server-side.
            broadcaster.publish(Channel::Metrics, json!({"tick": true}));
            tokio::time::sleep(Duration::from_millis(20)).await;
            while let Ok(event) = events.try_recv() {
                if let ClientEvent::Broadcast { channel, data, .. } = event {
                    if channel == Channel::Metrics {
                        return data;
                    }
                }
            }
        }
    })
    .await
    .expect("no metrics broadcast");
    assert_eq!(received["tick"], true);

    client.shutdown().await;
}
