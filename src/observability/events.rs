//! Observable lifecycle events
//!
//! Every lifecycle log line carries an `event` field with one of these
//! stable names. Events are explicit and typed.

use std::fmt;

use super::logger::Severity;

/// Observable events in the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Boot & Lifecycle
    /// Coordinator startup begins
    BootStart,
    /// Coordinator startup complete
    BootComplete,
    /// Configuration loaded
    ConfigLoaded,
    /// HTTP and command plane serving
    Serving,

    // Lock Manager
    /// Token granted to a new holder
    LockGranted,
    /// Same holder re-acquired the same mode
    LockAlreadyHeld,
    /// Acquire refused
    LockDenied,
    /// Token taken over by force
    LockForced,
    /// Token returned to idle
    LockReleased,
    /// Release request did not match the holder
    LockReleaseIgnored,
    /// Stale token reclaimed to idle
    LockReclaimed,
    /// Token record unreadable, treated as idle
    LockCorrupt,

    // Recording
    /// Recording session started
    RecordingStarted,
    /// Recording start failed or was aborted
    RecordingStartFailed,
    /// Start repeated for the active session
    RecordingStartIdempotent,
    /// Stop refused inside the protection window
    RecordingStopProtected,
    /// Graceful stop begun
    RecordingStopping,
    /// Session finished with valid output
    RecordingStopped,
    /// Session finished with failures
    RecordingFailed,
    /// A camera pipeline failed to start
    CameraStartFailed,
    /// Engine did not answer within its bound
    EngineTimeout,
    /// Engine reported end of stream
    EngineEos,
    /// Engine reported an asynchronous error
    EngineError,
    /// Output failed the structural probe
    IntegrityFailure,

    // Crash recovery
    /// Recovery of persisted session begins
    RecoveryBegin,
    /// Live pipelines confirmed, session resumed
    RecoveryResumed,
    /// Persisted state disagrees with the engine
    RecoveryMismatch,

    // Health
    /// Segment growth stalled or pipeline not running
    HealthStall,
    /// Pipeline restart attempted by health check
    HealthRecoveryAttempt,
    /// Camera exhausted recovery attempts
    CameraDegraded,

    // Preview
    /// Preview pipeline active
    PreviewStarted,
    /// Preview refused by the Lock Manager
    PreviewDenied,
    /// Preview pipeline stopped
    PreviewStopped,
    /// Preview torn down in favour of recording
    PreviewPreempted,

    // Command plane
    /// Client connection accepted
    ConnectionOpened,
    /// Client connection closed
    ConnectionClosed,
    /// Command executed
    CommandExecuted,
    /// Duplicate command id served from cache
    CommandDuplicate,
    /// Message rejected at the protocol layer
    ProtocolRejected,
    /// Client reconnect scheduled
    ClientReconnect,
    /// Client receive watchdog fired
    ClientWatchdog,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::BootStart => "DUALCAM_STARTUP_BEGIN",
            Event::BootComplete => "DUALCAM_STARTUP_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::Serving => "DUALCAM_SERVING",

            Event::LockGranted => "LOCK_GRANTED",
            Event::LockAlreadyHeld => "LOCK_ALREADY_HELD",
            Event::LockDenied => "LOCK_DENIED",
            Event::LockForced => "LOCK_FORCED",
            Event::LockReleased => "LOCK_RELEASED",
            Event::LockReleaseIgnored => "LOCK_RELEASE_IGNORED",
            Event::LockReclaimed => "LOCK_RECLAIMED",
            Event::LockCorrupt => "LOCK_CORRUPT",

            Event::RecordingStarted => "RECORDING_STARTED",
            Event::RecordingStartFailed => "RECORDING_START_FAILED",
            Event::RecordingStartIdempotent => "RECORDING_START_IDEMPOTENT",
            Event::RecordingStopProtected => "RECORDING_STOP_PROTECTED",
            Event::RecordingStopping => "RECORDING_STOPPING",
            Event::RecordingStopped => "RECORDING_STOPPED",
            Event::RecordingFailed => "RECORDING_FAILED",
            Event::CameraStartFailed => "CAMERA_START_FAILED",
            Event::EngineTimeout => "ENGINE_TIMEOUT",
            Event::EngineEos => "ENGINE_EOS",
            Event::EngineError => "ENGINE_ERROR",
            Event::IntegrityFailure => "INTEGRITY_FAILURE",

            Event::RecoveryBegin => "RECOVERY_BEGIN",
            Event::RecoveryResumed => "RECOVERY_RESUMED",
            Event::RecoveryMismatch => "RECOVERY_MISMATCH",

            Event::HealthStall => "HEALTH_STALL",
            Event::HealthRecoveryAttempt => "HEALTH_RECOVERY_ATTEMPT",
            Event::CameraDegraded => "CAMERA_DEGRADED",

            Event::PreviewStarted => "PREVIEW_STARTED",
            Event::PreviewDenied => "PREVIEW_DENIED",
            Event::PreviewStopped => "PREVIEW_STOPPED",
            Event::PreviewPreempted => "PREVIEW_PREEMPTED",

            Event::ConnectionOpened => "CONNECTION_OPENED",
            Event::ConnectionClosed => "CONNECTION_CLOSED",
            Event::CommandExecuted => "COMMAND_EXECUTED",
            Event::CommandDuplicate => "COMMAND_DUPLICATE",
            Event::ProtocolRejected => "PROTOCOL_REJECTED",
            Event::ClientReconnect => "CLIENT_RECONNECT",
            Event::ClientWatchdog => "CLIENT_WATCHDOG",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::LockCorrupt
            | Event::RecordingFailed
            | Event::IntegrityFailure
            | Event::RecoveryMismatch
            | Event::CameraDegraded
            | Event::EngineError => Severity::Error,

            Event::LockDenied
            | Event::LockForced
            | Event::LockReleaseIgnored
            | Event::LockReclaimed
            | Event::RecordingStartFailed
            | Event::RecordingStopProtected
            | Event::CameraStartFailed
            | Event::EngineTimeout
            | Event::HealthStall
            | Event::HealthRecoveryAttempt
            | Event::PreviewDenied
            | Event::PreviewPreempted
            | Event::ProtocolRejected
            | Event::ClientReconnect
            | Event::ClientWatchdog => Severity::Warn,

            Event::LockAlreadyHeld | Event::CommandDuplicate => Severity::Trace,

            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
