//! Recording Lifecycle Controller
//!
//! Drives one recording session through a crash-recoverable state machine:
//! lock acquisition, per-camera pipeline start, a stop-protection window,
//! graceful stop with guaranteed lock release, and a post-stop integrity
//! probe whose verdict is reported separately from the transport outcome.

mod controller;
mod health;
mod session;

pub use controller::{RecordingController, RecordingSettings};
pub use health::{CameraHealth, HealthReport};
pub use session::{
    generate_session_id, is_valid_session_id, segment_path, CameraFailure, CameraRecord,
    CameraStopReport, RecordingSession, RecordingStatus, RecoveryOutcome, RecoveryReport,
    SessionState, StartReport, StopReport,
};
