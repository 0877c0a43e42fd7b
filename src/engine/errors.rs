//! # Engine Errors

use std::io;

use thiserror::Error;

use super::types::{CameraId, PipelineHandle, PipelineKind, PipelineState};

/// Result type for pipeline engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown pipeline handle {0}")]
    UnknownHandle(PipelineHandle),

    #[error("pipeline {handle} is {state}, cannot {op}")]
    InvalidState {
        handle: PipelineHandle,
        state: PipelineState,
        op: &'static str,
    },

    #[error("no {kind} pipeline template configured")]
    EmptyTemplate { kind: PipelineKind },

    #[error("failed to spawn {kind} pipeline for camera {camera_id}: {source}")]
    Spawn {
        camera_id: CameraId,
        kind: PipelineKind,
        #[source]
        source: io::Error,
    },

    #[error("engine rejected camera {camera_id}: {reason}")]
    Rejected { camera_id: CameraId, reason: String },

    #[error("I/O error on pipeline {handle}: {source}")]
    Io {
        handle: PipelineHandle,
        #[source]
        source: io::Error,
    },
}
