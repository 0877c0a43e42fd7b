//! Pipeline engine value types

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera identifier as configured
pub type CameraId = u32;

/// Opaque reference to one engine pipeline.
///
/// Persisted in the session record so a restarted coordinator can ask the
/// engine whether the pipeline is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineHandle(pub u64);

impl fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

/// What a pipeline produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// Encoded, muxed output written to a segment file
    Recording,
    /// Low-latency live view, nothing persisted
    Preview,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Recording => write!(f, "recording"),
            PipelineKind::Preview => write!(f, "preview"),
        }
    }
}

/// Everything the engine needs to build one camera's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub kind: PipelineKind,
    pub device: String,
    pub output: Option<PathBuf>,
}

impl PipelineSpec {
    pub fn recording(device: impl Into<String>, output: PathBuf) -> Self {
        Self {
            kind: PipelineKind::Recording,
            device: device.into(),
            output: Some(output),
        }
    }

    pub fn preview(device: impl Into<String>) -> Self {
        Self {
            kind: PipelineKind::Preview,
            device: device.into(),
            output: None,
        }
    }
}

/// Engine-reported pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Created, not started
    Ready,
    Running,
    Stopped,
    Error,
    /// The engine has no record of the handle
    Unknown,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Ready => "ready",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
            PipelineState::Error => "error",
            PipelineState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a stop request.
///
/// `timed_out` is set whenever the bound elapsed; it is never folded into
/// success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOutcome {
    pub eos_received: bool,
    pub finalized: bool,
    pub timed_out: bool,
}

impl StopOutcome {
    pub fn timed_out() -> Self {
        Self {
            eos_received: false,
            finalized: false,
            timed_out: true,
        }
    }
}

/// Asynchronous notification from a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Eos {
        camera_id: CameraId,
        handle: PipelineHandle,
    },
    Error {
        camera_id: CameraId,
        handle: PipelineHandle,
        message: String,
    },
}

impl EngineEvent {
    pub fn handle(&self) -> PipelineHandle {
        match self {
            EngineEvent::Eos { handle, .. } | EngineEvent::Error { handle, .. } => *handle,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        match self {
            EngineEvent::Eos { camera_id, .. } | EngineEvent::Error { camera_id, .. } => {
                *camera_id
            }
        }
    }
}

/// Callback registered through `on_eos` / `on_error`
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Size and last growth of a pipeline's current output segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub bytes: u64,
    pub modified_at: DateTime<Utc>,
}
