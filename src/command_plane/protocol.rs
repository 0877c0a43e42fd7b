//! Command-plane wire protocol
//!
//! JSON text frames, internally tagged by `type`. Every frame carries the
//! protocol version in `v`; a frame with a missing or different version is
//! answered with `error{code: "invalid_version"}` and otherwise ignored.
//!
//! ```json
//! {"v":1,"type":"command","id":"c-17","action":"recording.start","params":{"session_id":"m1"}}
//! {"v":1,"type":"command_ack","id":"c-17","status":"received"}
//! {"v":1,"type":"command_result","id":"c-17","success":true,"data":{...}}
//! {"v":1,"type":"broadcast","channel":"status","seq":42,"data":{...}}
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{ProtocolError, ProtocolResult};

/// Current wire version
pub const PROTOCOL_VERSION: u64 = 1;

/// Named broadcast channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Status,
    Metrics,
    Health,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Status, Channel::Metrics, Channel::Health];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Status => "status",
            Channel::Metrics => "metrics",
            Channel::Health => "health",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Channel::Status => 0,
            Channel::Metrics => 1,
            Channel::Health => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
    },
    Subscribe {
        channels: Vec<Channel>,
    },
    Unsubscribe {
        channels: Vec<Channel>,
    },
    Command {
        id: String,
        action: String,
        #[serde(default)]
        params: Value,
    },
}

/// Acknowledgement states of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// First sighting of this id, execution begins
    Received,
    /// Same id already executing, the result follows when it completes
    Processing,
}

/// Failure detail of a command result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

/// Outcome of one logical command; cached verbatim for duplicate ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl CommandOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Failed outcome that still carries the structured report
    pub fn failed_with(code: impl Into<String>, message: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::failed(code, message)
        }
    }
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection
    Hello {
        connection_id: String,
        node_id: String,
        subscriptions: Vec<Channel>,
        channels: Vec<Channel>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
        server_time: i64,
    },
    /// Channel set after a subscribe or unsubscribe delta
    Subscribed {
        channels: Vec<Channel>,
    },
    CommandAck {
        id: String,
        status: AckStatus,
    },
    CommandResult {
        id: String,
        #[serde(flatten)]
        outcome: CommandOutcome,
    },
    Error {
        code: String,
        message: String,
    },
    Broadcast {
        channel: Channel,
        seq: u64,
        data: Value,
    },
}

impl ServerMessage {
    pub fn error(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Versioned<'a, T> {
    v: u64,
    #[serde(flatten)]
    body: &'a T,
}

/// Serialize a frame with the current version stamped on it
pub fn encode<T: Serialize>(message: &T) -> ProtocolResult<String> {
    serde_json::to_string(&Versioned {
        v: PROTOCOL_VERSION,
        body: message,
    })
    .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(text: &str) -> ProtocolResult<T> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| ProtocolError::InvalidMessage("frame must be a JSON object".to_string()))?;

    match object.remove("v").and_then(|v| v.as_u64()) {
        Some(PROTOCOL_VERSION) => {}
        other => return Err(ProtocolError::InvalidVersion { received: other }),
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

pub fn decode_client(text: &str) -> ProtocolResult<ClientMessage> {
    decode(text)
}

pub fn decode_server(text: &str) -> ProtocolResult<ServerMessage> {
    decode(text)
}
