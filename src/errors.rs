//! Failure Taxonomy
//!
//! Controllers never return `Err` across the command plane. Every outcome is a
//! structured result with a success flag and a reason; when the outcome is a
//! failure it is classified into exactly one of these kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown camera id, malformed params, wrong state for the request.
    /// Rejected immediately, no state change.
    Validation,

    /// Lock held by a different mode or holder and no force.
    /// Rejected, no state change. Expected and frequent.
    ResourceConflict,

    /// The pipeline engine did not confirm within its bound.
    EngineTimeout,

    /// Pipelines stopped correctly but the output failed structural validation.
    IntegrityFailure,

    /// Persisted state disagrees with live engine state after restart.
    CrashRecoveryMismatch,

    /// Durable state could not be read or written.
    Storage,

    /// The engine refused or failed an operation outright.
    Engine,
}

impl ErrorKind {
    /// Stable error code for wire messages
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::ResourceConflict => "resource_conflict",
            Self::EngineTimeout => "engine_timeout",
            Self::IntegrityFailure => "integrity_failure",
            Self::CrashRecoveryMismatch => "crash_recovery_mismatch",
            Self::Storage => "storage_error",
            Self::Engine => "engine_error",
        }
    }

    /// Inverse of `code`
    pub fn from_code(code: &str) -> Option<Self> {
        let kind = match code {
            "validation_error" => Self::Validation,
            "resource_conflict" => Self::ResourceConflict,
            "engine_timeout" => Self::EngineTimeout,
            "integrity_failure" => Self::IntegrityFailure,
            "crash_recovery_mismatch" => Self::CrashRecoveryMismatch,
            "storage_error" => Self::Storage,
            "engine_error" => Self::Engine,
            _ => return None,
        };
        Some(kind)
    }

    /// HTTP status used by the one-shot request facade
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::ResourceConflict => 409,
            Self::EngineTimeout => 504,
            Self::IntegrityFailure => 500,
            Self::CrashRecoveryMismatch => 500,
            Self::Storage => 500,
            Self::Engine => 502,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
