//! Per-connection WebSocket loop
//!
//! One task per connection multiplexes four sources with `tokio::select!`:
//! inbound frames, replies produced by command tasks, the broadcast bus and
//! the idle deadline. Commands run on their own tasks so a slow stop never
//! blocks pings or broadcasts on the same connection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::broadcaster::Broadcaster;
use super::errors::ProtocolError;
use super::executor::CommandExecutor;
use super::protocol::{self, Channel, ClientMessage, ServerMessage};
use crate::config::CommandPlaneConfig;
use crate::observability::Event;

const OUTGOING_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct CommandPlaneSettings {
    /// Connections silent for longer than this are closed
    pub idle_timeout: Duration,
    /// Subscriptions every connection starts with
    pub default_subscriptions: Vec<Channel>,
}

impl Default for CommandPlaneSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            default_subscriptions: vec![Channel::Status],
        }
    }
}

impl CommandPlaneSettings {
    pub fn from_config(config: &CommandPlaneConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            ..Self::default()
        }
    }
}

/// Shared state behind every command-plane connection
pub struct CommandPlane {
    settings: CommandPlaneSettings,
    executor: Arc<CommandExecutor>,
    broadcaster: Arc<Broadcaster>,
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_frame(sink: &mut WsSink, message: &ServerMessage) -> bool {
    match protocol::encode(message) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode command-plane frame");
            true
        }
    }
}

impl CommandPlane {
    pub fn new(
        settings: CommandPlaneSettings,
        executor: Arc<CommandExecutor>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            settings,
            executor,
            broadcaster,
        }
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Drive one upgraded connection until it closes or goes idle.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let connection_id = Uuid::new_v4().to_string();
        let activity = Arc::clone(self.executor.activity());
        self.executor.metrics().increment_connections_opened();
        activity.record(
            Event::ConnectionOpened,
            format!("command-plane connection {}", connection_id),
        );

        let (mut sender, mut receiver) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTGOING_CAPACITY);
        let mut bus = self.broadcaster.subscribe();
        let mut subscriptions: BTreeSet<Channel> =
            self.settings.default_subscriptions.iter().copied().collect();

        let hello = ServerMessage::Hello {
            connection_id: connection_id.clone(),
            node_id: self.executor.node_id().to_string(),
            subscriptions: subscriptions.iter().copied().collect(),
            channels: Channel::ALL.to_vec(),
        };
        if !send_frame(&mut sender, &hello).await {
            return;
        }

        let idle_timeout = self.settings.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                inbound = receiver.next() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_text(&text, &mut subscriptions, &out_tx) {
                                if !send_frame(&mut sender, &reply).await {
                                    break "send failed";
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let err = ProtocolError::Unsupported("binary frames".to_string());
                            if !send_frame(&mut sender, &ServerMessage::error(&err)).await {
                                break "send failed";
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sender.send(Message::Pong(data)).await.is_err() {
                                break "send failed";
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break "closed by client",
                        Some(Err(e)) => {
                            tracing::debug!(connection_id = %connection_id, error = %e, "websocket receive error");
                            break "receive error";
                        }
                    }
                }

                Some(reply) = out_rx.recv() => {
                    if !send_frame(&mut sender, &reply).await {
                        break "send failed";
                    }
                }

                frame = bus.recv() => {
                    match frame {
                        Ok(b) if subscriptions.contains(&b.channel) => {
                            let message = ServerMessage::Broadcast {
                                channel: b.channel,
                                seq: b.seq,
                                data: b.data,
                            };
                            if !send_frame(&mut sender, &message).await {
                                break "send failed";
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(connection_id = %connection_id, skipped, "broadcast receiver lagged");
                        }
                        Err(RecvError::Closed) => break "broadcaster closed",
                    }
                }

                _ = &mut idle => break "idle timeout",
            }
        };

        let _ = sender.close().await;
        activity.record(
            Event::ConnectionClosed,
            format!("command-plane connection {} closed: {}", connection_id, reason),
        );
    }

    /// Handle one text frame; returns the immediate reply, if any.
    ///
    /// Commands are spawned and answer through `out_tx`.
    fn handle_text(
        &self,
        text: &str,
        subscriptions: &mut BTreeSet<Channel>,
        out_tx: &mpsc::Sender<ServerMessage>,
    ) -> Option<ServerMessage> {
        let message = match protocol::decode_client(text) {
            Ok(message) => message,
            Err(err) => {
                self.executor
                    .activity()
                    .record(Event::ProtocolRejected, err.to_string());
                return Some(ServerMessage::error(&err));
            }
        };

        match message {
            ClientMessage::Ping { nonce } => Some(ServerMessage::Pong {
                nonce,
                server_time: chrono::Utc::now().timestamp_millis(),
            }),
            ClientMessage::Subscribe { channels } => {
                subscriptions.extend(channels);
                Some(ServerMessage::Subscribed {
                    channels: subscriptions.iter().copied().collect(),
                })
            }
            ClientMessage::Unsubscribe { channels } => {
                for channel in channels {
                    subscriptions.remove(&channel);
                }
                Some(ServerMessage::Subscribed {
                    channels: subscriptions.iter().copied().collect(),
                })
            }
            ClientMessage::Command { id, action, params } => {
                if id.trim().is_empty() {
                    let err = ProtocolError::InvalidMessage("command id must not be empty".to_string());
                    return Some(ServerMessage::error(&err));
                }
                let executor = Arc::clone(&self.executor);
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let ack_tx = out.clone();
                    let ack_id = id.clone();
                    let outcome = executor
                        .submit(Some(&id), &action, params, move |status| {
                            let _ = ack_tx.try_send(ServerMessage::CommandAck { id: ack_id, status });
                        })
                        .await;
                    let _ = out.send(ServerMessage::CommandResult { id, outcome }).await;
                });
                None
            }
        }
    }
}
