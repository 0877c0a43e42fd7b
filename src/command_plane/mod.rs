//! Command Plane
//!
//! Remote control over WebSocket:
//!
//! - `hello` on connect, naming the default subscriptions
//! - `ping`/`pong` liveness
//! - `subscribe`/`unsubscribe` channel deltas, answered by `subscribed`
//! - `command{id, action, params}` answered by `command_ack` then
//!   `command_result`, at most once per id
//! - one `broadcast` frame per subscribed channel per tick
//!
//! Every frame carries the protocol version `v`.

mod broadcaster;
mod client;
mod errors;
mod executor;
mod idempotency;
mod protocol;
mod server;

pub use broadcaster::{Broadcast, BroadcastIntervals, Broadcaster};
pub use client::{
    backoff_delay, ClientEvent, ClientSettings, CommandPlaneClient, DisconnectReason,
};
pub use errors::{ClientError, ClientResult, ProtocolError, ProtocolResult};
pub use executor::{CommandExecutor, CoordinatorStatus, RemoteAction};
pub use idempotency::{Claim, Completion, IdempotencyCache};
pub use protocol::{
    decode_client, decode_server, encode, AckStatus, Channel, ClientMessage, CommandError,
    CommandOutcome, ServerMessage, PROTOCOL_VERSION,
};
pub use server::{CommandPlane, CommandPlaneSettings};
