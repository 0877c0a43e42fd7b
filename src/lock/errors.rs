//! # Lock Manager Errors
//!
//! Denials are not errors: a denied acquire is an expected, cheap outcome
//! reported through `AcquireOutcome::Denied`. These errors cover only
//! misuse and storage failures.

use thiserror::Error;

use super::token::Mode;
use crate::store::StoreError;

/// Result type for Lock Manager operations
pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// Token record could not be read or written
    #[error("token storage failed: {0}")]
    Store(#[from] StoreError),

    /// Acquire or release asked for a mode that cannot be held
    #[error("mode '{0}' cannot be acquired or released")]
    InvalidMode(Mode),

    /// In-process mutex poisoned by a panicking holder
    #[error("lock manager state poisoned")]
    Poisoned,

    /// Blocking-pool task running a lock operation did not complete
    #[error("lock task failed: {0}")]
    Task(String),
}
