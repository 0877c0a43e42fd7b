//! Recording session record
//!
//! The session record is the crash-recovery anchor: it is written durably
//! before `start` returns and after every state transition, so a restarted
//! coordinator can reconcile it against what the engine reports.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{CameraId, PipelineHandle, ProbeReport, StopOutcome};
use crate::errors::ErrorKind;

/// Recording lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }

    /// Pipelines may be live in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Recording | SessionState::Stopping
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-camera part of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub camera_id: CameraId,
    pub pipeline_ref: Option<PipelineHandle>,
    /// Output segments in write order; health recovery appends new ones
    pub segments: Vec<PathBuf>,
    pub started: bool,
    pub eos_received: bool,
    pub finalized: bool,
    pub timed_out: bool,
    pub integrity_ok: Option<bool>,
    pub last_error: Option<String>,
    pub degraded: bool,
    pub recovery_attempts: u32,
}

impl CameraRecord {
    pub fn new(camera_id: CameraId, first_segment: PathBuf) -> Self {
        Self {
            camera_id,
            pipeline_ref: None,
            segments: vec![first_segment],
            started: false,
            eos_received: false,
            finalized: false,
            timed_out: false,
            integrity_ok: None,
            last_error: None,
            degraded: false,
            recovery_attempts: 0,
        }
    }

    pub fn current_segment(&self) -> Option<&PathBuf> {
        self.segments.last()
    }

    /// Transport flags describe the current pipeline only. End-of-stream
    /// already reported by its event stream is kept.
    pub(crate) fn apply_stop(&mut self, outcome: StopOutcome) {
        self.eos_received |= outcome.eos_received;
        self.finalized = outcome.finalized;
        self.timed_out = outcome.timed_out;
    }

    /// Point the camera at a fresh pipeline
    pub(crate) fn attach(&mut self, handle: PipelineHandle) {
        self.pipeline_ref = Some(handle);
        self.eos_received = false;
        self.finalized = false;
        self.timed_out = false;
    }
}

/// Durable recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub session_id: String,
    pub state: SessionState,
    pub holder_id: String,
    pub started_at: DateTime<Utc>,
    pub protected_until: DateTime<Utc>,
    pub per_camera: BTreeMap<CameraId, CameraRecord>,
    pub require_all_cameras: bool,
    pub force_requested: bool,
    pub updated_at: DateTime<Utc>,
}

impl RecordingSession {
    pub fn is_protected(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Recording && now < self.protected_until
    }

    pub fn started_cameras(&self) -> Vec<CameraId> {
        self.per_camera
            .values()
            .filter(|c| c.started)
            .map(|c| c.camera_id)
            .collect()
    }

    pub(crate) fn touch(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Record for the camera owning `handle`
    pub(crate) fn camera_for_handle(&mut self, handle: PipelineHandle) -> Option<&mut CameraRecord> {
        self.per_camera
            .values_mut()
            .find(|c| c.pipeline_ref == Some(handle))
    }
}

/// `{recordings_dir}/{session_id}/cam{camera_id}_seg{n}.mp4`
pub fn segment_path(recordings_dir: &Path, session_id: &str, camera_id: CameraId, n: usize) -> PathBuf {
    recordings_dir
        .join(session_id)
        .join(format!("cam{}_seg{}.mp4", camera_id, n))
}

/// Timestamped id with a random suffix, safe as a directory name
pub fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
}

/// Session ids become directory names: `[A-Za-z0-9_-]`, 1..=64 chars
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A camera that failed to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraFailure {
    pub camera_id: CameraId,
    pub reason: String,
    pub timed_out: bool,
}

/// Result of `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub success: bool,
    pub reason: String,
    pub error: Option<ErrorKind>,
    pub session_id: Option<String>,
    pub state: SessionState,
    pub idempotent: bool,
    pub preempted_preview: bool,
    pub superseded_session: Option<String>,
    pub started_cameras: Vec<CameraId>,
    pub failed_cameras: Vec<CameraFailure>,
    pub protected_until: Option<DateTime<Utc>>,
    /// Current holder when denied
    pub holder: Option<String>,
    pub force_would_succeed: Option<bool>,
}

impl StartReport {
    pub(crate) fn rejected(
        error: ErrorKind,
        reason: impl Into<String>,
        state: SessionState,
    ) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            error: Some(error),
            session_id: None,
            state,
            idempotent: false,
            preempted_preview: false,
            superseded_session: None,
            started_cameras: Vec::new(),
            failed_cameras: Vec::new(),
            protected_until: None,
            holder: None,
            force_would_succeed: None,
        }
    }
}

/// Per-camera part of a stop report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraStopReport {
    pub camera_id: CameraId,
    pub eos_received: bool,
    pub finalized: bool,
    pub timed_out: bool,
    pub integrity_ok: Option<bool>,
    pub probes: Vec<ProbeReport>,
    pub last_error: Option<String>,
}

/// Result of `stop`.
///
/// `transport_success` (every pipeline reached end-of-stream within its
/// bound) and `integrity_ok` (every segment is structurally valid) are
/// independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub success: bool,
    pub reason: String,
    pub error: Option<ErrorKind>,
    pub session_id: Option<String>,
    pub state: SessionState,
    pub protected: bool,
    pub protected_until: Option<DateTime<Utc>>,
    /// Session holder when a protected stop is refused
    pub holder: Option<String>,
    pub force_would_succeed: Option<bool>,
    pub transport_success: bool,
    pub integrity_ok: bool,
    pub lock_released: bool,
    pub cameras: Vec<CameraStopReport>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl StopReport {
    pub(crate) fn rejected(error: ErrorKind, reason: impl Into<String>, state: SessionState) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            error: Some(error),
            session_id: None,
            state,
            protected: false,
            protected_until: None,
            holder: None,
            force_would_succeed: None,
            transport_success: false,
            integrity_ok: false,
            lock_released: false,
            cameras: Vec::new(),
            stopped_at: None,
        }
    }
}

/// Snapshot published to status subscribers.
///
/// `session_epoch` increases by one for every session the controller creates
/// or resumes; a consumer never needs to accept a lower epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingStatus {
    pub session_epoch: u64,
    pub state: SessionState,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub protected_until: Option<DateTime<Utc>>,
    pub cameras: Vec<CameraRecord>,
    pub last_report: Option<StopReport>,
}

impl RecordingStatus {
    pub fn idle() -> Self {
        Self {
            session_epoch: 0,
            state: SessionState::Idle,
            session_id: None,
            started_at: None,
            protected_until: None,
            cameras: Vec::new(),
            last_report: None,
        }
    }
}

/// How `recover_on_restart` resolved the persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    NothingToRecover,
    Resumed,
    MarkedFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub outcome: RecoveryOutcome,
    pub session_id: Option<String>,
    pub reason: String,
    pub error: Option<ErrorKind>,
}
