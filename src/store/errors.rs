//! # Store Errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for durable store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Value could not be serialized
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Record present but unreadable or failing its checksum
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Guard file could not be acquired in time
    #[error("timed out waiting for guard {path}")]
    GuardTimeout { path: PathBuf },
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns true when the record exists but cannot be trusted
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}
