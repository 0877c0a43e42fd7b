//! CLI-specific error types
//!
//! Every CLI error is fatal: `main` prints it and exits non-zero.

use std::fmt;
use std::io;

use crate::command_plane::ClientError;
use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;
use crate::lock::LockError;
use crate::store::StoreError;

/// CLI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout, runtime)
    IoError,
    /// Durable state unreadable
    StateError,
    /// Boot or serve failed
    BootFailed,
    /// Bad arguments
    InvalidArgument,
    /// Command plane unreachable or timed out
    ClientFailed,
}

impl CliErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "DUALCAM_CLI_CONFIG_ERROR",
            Self::IoError => "DUALCAM_CLI_IO_ERROR",
            Self::StateError => "DUALCAM_CLI_STATE_ERROR",
            Self::BootFailed => "DUALCAM_CLI_BOOT_FAILED",
            Self::InvalidArgument => "DUALCAM_CLI_INVALID_ARGUMENT",
            Self::ClientFailed => "DUALCAM_CLI_CLIENT_FAILED",
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn state_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::StateError, msg)
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn client_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ClientFailed, msg)
    }

    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<CoordinatorError> for CliError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Config(e) => e.into(),
            other => Self::boot_failed(other.to_string()),
        }
    }
}

impl From<LockError> for CliError {
    fn from(e: LockError) -> Self {
        Self::state_error(e.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        Self::state_error(e.to_string())
    }
}

impl From<ClientError> for CliError {
    fn from(e: ClientError) -> Self {
        Self::client_failed(e.to_string())
    }
}

pub type CliResult<T> = Result<T, CliError>;
