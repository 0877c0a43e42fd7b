//! Command-plane errors

use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A frame that cannot be accepted at the protocol layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {received:?}, expected {}", super::protocol::PROTOCOL_VERSION)]
    InvalidVersion { received: Option<u64> },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unsupported frame: {0}")]
    Unsupported(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Stable code carried in `error{code}` frames
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidVersion { .. } => "invalid_version",
            Self::InvalidMessage(_) => "invalid_message",
            Self::Unsupported(_) => "unsupported",
            Self::Encode(_) => "internal_error",
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Failures surfaced by `CommandPlaneClient`
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has shut down")]
    Closed,

    #[error("no result for command {id} within {waited_ms}ms")]
    Timeout { id: String, waited_ms: u64 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
