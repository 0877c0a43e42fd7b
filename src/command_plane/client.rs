//! Reconnecting command-plane client
//!
//! Keeps one WebSocket open to a coordinator and hides connection loss from
//! callers:
//!
//! - exponential backoff with jitter between attempts, reset to the base
//!   interval once a connection succeeds
//! - a receive watchdog: if no frame of any kind arrives within
//!   `receive_timeout` the socket is abandoned and redialled, even when it
//!   still looks open (half-open connections never deliver a close)
//! - on every connect the prior channel set is resubscribed and every
//!   command without a result is resent under its original id, so the
//!   server's idempotency cache answers instead of re-executing

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::errors::{ClientError, ClientResult};
use super::protocol::{self, AckStatus, Channel, ClientMessage, CommandOutcome, ServerMessage};
use crate::config::ClientConfig;
use crate::observability::{emit, Event};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// No frame within this window forces a reconnect
    pub receive_timeout: Duration,
    /// Channels to hold across reconnects
    pub subscriptions: Vec<Channel>,
}

impl ClientSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_config(url, &ClientConfig::default())
    }

    pub fn from_config(url: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            url: url.into(),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            receive_timeout: Duration::from_millis(config.receive_timeout_ms),
            subscriptions: vec![Channel::Status],
        }
    }

    fn ping_interval(&self) -> Duration {
        (self.receive_timeout / 3).max(Duration::from_millis(10))
    }
}

/// Un-jittered delay before reconnect attempt `attempt` (0-based)
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Add up to 20% random jitter, never exceeding `max`
fn with_jitter(delay: Duration, max: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 5;
    let extra = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    (delay + Duration::from_millis(extra)).min(max)
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Receive watchdog expired
    Watchdog,
    /// Peer closed the socket
    Closed,
    Error(String),
}

/// Observable client activity
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { connection: u64 },
    Disconnected { reason: DisconnectReason },
    Hello { connection_id: String, subscriptions: Vec<Channel> },
    Ack { id: String, status: AckStatus },
    Broadcast { channel: Channel, seq: u64, data: Value },
    ServerError { code: String, message: String },
}

struct Pending {
    order: u64,
    action: String,
    params: Value,
    reply: oneshot::Sender<CommandOutcome>,
}

struct Shared {
    subscriptions: Mutex<BTreeSet<Channel>>,
    pending: Mutex<HashMap<String, Pending>>,
    next_order: AtomicU64,
    connections: AtomicU64,
    watchdog_fires: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    fn subscriptions(&self) -> Vec<Channel> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands still waiting for a result, oldest first
    fn unanswered(&self) -> Vec<ClientMessage> {
        let pending = self.pending();
        let mut commands: Vec<(u64, ClientMessage)> = pending
            .iter()
            .map(|(id, p)| {
                (
                    p.order,
                    ClientMessage::Command {
                        id: id.clone(),
                        action: p.action.clone(),
                        params: p.params.clone(),
                    },
                )
            })
            .collect();
        commands.sort_by_key(|(order, _)| *order);
        commands.into_iter().map(|(_, c)| c).collect()
    }

    fn notify(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

enum Request {
    Send(ClientMessage),
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Lost(DisconnectReason),
}

type ClientSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct CommandPlaneClient {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Request>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandPlaneClient {
    /// Start the connection task. Returns immediately; the first connect
    /// happens in the background.
    pub fn connect(settings: ClientSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(settings.subscriptions.iter().copied().collect()),
            pending: Mutex::new(HashMap::new()),
            next_order: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            watchdog_fires: AtomicU64::new(0),
            events,
        });
        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(Arc::clone(&shared), settings, rx));
        Self {
            shared,
            requests,
            task: Mutex::new(Some(task)),
        }
    }

    /// Send a command under a fresh id and wait for its result.
    pub async fn command(&self, action: &str, params: Value) -> ClientResult<CommandOutcome> {
        let id = Uuid::new_v4().to_string();
        self.command_with_id(&id, action, params).await
    }

    /// Send a command under a caller-chosen id and wait for its result.
    ///
    /// The command is resent after every reconnect until a result arrives.
    pub async fn command_with_id(
        &self,
        id: &str,
        action: &str,
        params: Value,
    ) -> ClientResult<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let order = self.shared.next_order.fetch_add(1, Ordering::SeqCst);
        self.shared.pending().insert(
            id.to_string(),
            Pending {
                order,
                action: action.to_string(),
                params: params.clone(),
                reply: tx,
            },
        );

        let message = ClientMessage::Command {
            id: id.to_string(),
            action: action.to_string(),
            params,
        };
        if self.requests.send(Request::Send(message)).is_err() {
            self.shared.pending().remove(id);
            return Err(ClientError::Closed);
        }
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// `command` bounded by `wait`
    pub async fn command_within(
        &self,
        action: &str,
        params: Value,
        wait: Duration,
    ) -> ClientResult<CommandOutcome> {
        let id = Uuid::new_v4().to_string();
        match tokio::time::timeout(wait, self.command_with_id(&id, action, params)).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(ClientError::Timeout {
                    id,
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    pub fn subscribe(&self, channels: &[Channel]) -> ClientResult<()> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(channels.iter().copied());
        self.send(ClientMessage::Subscribe {
            channels: channels.to_vec(),
        })
    }

    pub fn unsubscribe(&self, channels: &[Channel]) -> ClientResult<()> {
        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for channel in channels {
                subscriptions.remove(channel);
            }
        }
        self.send(ClientMessage::Unsubscribe {
            channels: channels.to_vec(),
        })
    }

    fn send(&self, message: ClientMessage) -> ClientResult<()> {
        self.requests
            .send(Request::Send(message))
            .map_err(|_| ClientError::Closed)
    }

    /// Channels the client keeps subscribed across reconnects
    pub fn subscriptions(&self) -> Vec<Channel> {
        self.shared.subscriptions()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Successful connects so far
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn watchdog_fires(&self) -> u64 {
        self.shared.watchdog_fires.load(Ordering::SeqCst)
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for CommandPlaneClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    settings: ClientSettings,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_async(settings.url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                let connection = shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(url = %settings.url, connection, "command plane connected");
                shared.notify(ClientEvent::Connected { connection });

                match session(&shared, &settings, ws, &mut requests).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => {
                        shared.notify(ClientEvent::Disconnected { reason });
                    }
                }
            }
            Err(e) => {
                tracing::debug!(url = %settings.url, error = %e, "command plane connect failed");
            }
        }

        let delay = with_jitter(
            backoff_delay(settings.reconnect_base, settings.reconnect_max, attempt),
            settings.reconnect_max,
        );
        attempt = attempt.saturating_add(1);
        emit(
            Event::ClientReconnect,
            &format!("reconnecting to {} in {:?} (attempt {})", settings.url, delay, attempt),
        );

        let wait = tokio::time::sleep(delay);
        tokio::pin!(wait);
        let shutdown = loop {
            tokio::select! {
                _ = &mut wait => break false,
                request = requests.recv() => match request {
                    None | Some(Request::Shutdown) => break true,
                    // Subscriptions and unanswered commands are replayed on connect.
                    Some(Request::Send(_)) => {}
                },
            }
        };
        if shutdown {
            break;
        }
    }

    // Dropping the reply senders resolves every waiter with `Closed`.
    shared.pending().clear();
}

async fn send_frame(sink: &mut ClientSink, message: &ClientMessage) -> Result<(), DisconnectReason> {
    let json = protocol::encode(message).map_err(|e| DisconnectReason::Error(e.to_string()))?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| DisconnectReason::Error(e.to_string()))
}

async fn session(
    shared: &Shared,
    settings: &ClientSettings,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    let subscriptions = shared.subscriptions();
    let mut replay = Vec::new();
    if !subscriptions.is_empty() {
        replay.push(ClientMessage::Subscribe {
            channels: subscriptions,
        });
    }
    replay.extend(shared.unanswered());
    for message in &replay {
        if let Err(reason) = send_frame(&mut sink, message).await {
            return SessionEnd::Lost(reason);
        }
    }

    let receive_timeout = settings.receive_timeout;
    let watchdog = tokio::time::sleep(receive_timeout);
    tokio::pin!(watchdog);
    let ping_every = settings.ping_interval();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    let mut nonce: u64 = 0;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                watchdog.as_mut().reset(Instant::now() + receive_timeout);
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(reason) = handle_text(shared, &text, &mut sink).await {
                            return SessionEnd::Lost(reason);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return SessionEnd::Lost(DisconnectReason::Error(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost(DisconnectReason::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::Lost(DisconnectReason::Error(e.to_string()));
                    }
                }
            }

            request = requests.recv() => {
                match request {
                    None | Some(Request::Shutdown) => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Request::Send(message)) => {
                        if let Err(reason) = send_frame(&mut sink, &message).await {
                            return SessionEnd::Lost(reason);
                        }
                    }
                }
            }

            _ = ping.tick() => {
                nonce += 1;
                if let Err(reason) = send_frame(&mut sink, &ClientMessage::Ping { nonce: Some(nonce) }).await {
                    return SessionEnd::Lost(reason);
                }
            }

            _ = &mut watchdog => {
                shared.watchdog_fires.fetch_add(1, Ordering::SeqCst);
                emit(
                    Event::ClientWatchdog,
                    &format!("no frame from {} within {:?}, reconnecting", settings.url, receive_timeout),
                );
                return SessionEnd::Lost(DisconnectReason::Watchdog);
            }
        }
    }
}

async fn handle_text(
    shared: &Shared,
    text: &str,
    sink: &mut ClientSink,
) -> Result<(), DisconnectReason> {
    let message = match protocol::decode_server(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed frame from server");
            return Ok(());
        }
    };

    match message {
        ServerMessage::Hello {
            connection_id,
            subscriptions,
            ..
        } => {
            let wanted: BTreeSet<Channel> = shared.subscriptions().into_iter().collect();
            let extra: Vec<Channel> = subscriptions
                .iter()
                .copied()
                .filter(|c| !wanted.contains(c))
                .collect();
            if !extra.is_empty() {
                send_frame(sink, &ClientMessage::Unsubscribe { channels: extra }).await?;
            }
            shared.notify(ClientEvent::Hello {
                connection_id,
                subscriptions,
            });
        }
        ServerMessage::CommandAck { id, status } => {
            shared.notify(ClientEvent::Ack { id, status });
        }
        ServerMessage::CommandResult { id, outcome } => {
            if let Some(pending) = shared.pending().remove(&id) {
                let _ = pending.reply.send(outcome);
            }
        }
        ServerMessage::Broadcast { channel, seq, data } => {
            shared.notify(ClientEvent::Broadcast { channel, seq, data });
        }
        ServerMessage::Error { code, message } => {
            tracing::warn!(code = %code, "command plane error: {}", message);
            shared.notify(ClientEvent::ServerError { code, message });
        }
        ServerMessage::Pong { .. } | ServerMessage::Subscribed { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let max = Duration::from_secs(30);
        for _ in 0..100 {
            let d = with_jitter(Duration::from_millis(1000), max);
            assert!(d >= Duration::from_millis(1000));
            assert!(d <= Duration::from_millis(1200));
        }
        assert_eq!(with_jitter(max, max), max);
    }

    #[test]
    fn test_ping_interval_is_inside_watchdog_window() {
        let settings = ClientSettings::new("ws://127.0.0.1:1/ws");
        assert!(settings.ping_interval() < settings.receive_timeout);
        assert_eq!(settings.subscriptions, vec![Channel::Status]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_commands() {
        let mut settings = ClientSettings::new("ws://127.0.0.1:1/ws");
        settings.reconnect_base = Duration::from_millis(10);
        settings.reconnect_max = Duration::from_millis(20);
        let client = Arc::new(CommandPlaneClient::connect(settings));

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.command("status.get", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Closed)));
    }
}
