//! Crash point injection for testing durability
//!
//! Crash points sit around every durable write of the exclusivity token and
//! the recording session record. They are enabled through the
//! `DUALCAM_CRASH_POINT` environment variable.
//!
//! When a crash point is enabled, the coordinator terminates immediately via
//! `std::process::abort()`: no cleanup, no unwinding, no catching.
//!
//! # Usage
//!
//! ```ignore
//! use dualcam::crash_point::{maybe_crash, points};
//!
//! maybe_crash(points::SESSION_BEFORE_RENAME);
//! ```
//!
//! # Testing
//!
//! ```bash
//! DUALCAM_CRASH_POINT=session_after_rename dualcam serve
//! ```

use std::sync::OnceLock;

/// Cache the crash point name to avoid repeated env var lookups
static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

/// Environment variable naming the active crash point
pub const CRASH_POINT_ENV: &str = "DUALCAM_CRASH_POINT";

#[inline]
fn get_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var(CRASH_POINT_ENV).ok())
        .as_deref()
}

/// Check if a specific crash point is enabled
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    get_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if the named crash point is enabled.
///
/// No-op when `DUALCAM_CRASH_POINT` is unset or names another point.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Exclusivity token
    pub const TOKEN_BEFORE_RENAME: &str = "token_before_rename";
    pub const TOKEN_AFTER_RENAME: &str = "token_after_rename";

    // Recording session record
    pub const SESSION_BEFORE_RENAME: &str = "session_before_rename";
    pub const SESSION_AFTER_RENAME: &str = "session_after_rename";

    // Recording lifecycle
    pub const RECORDING_AFTER_ENGINE_START: &str = "recording_after_engine_start";
    pub const RECORDING_AFTER_ENGINE_STOP: &str = "recording_after_engine_stop";

    /// Get all crash point names
    pub fn all() -> &'static [&'static str] {
        &[
            TOKEN_BEFORE_RENAME,
            TOKEN_AFTER_RENAME,
            SESSION_BEFORE_RENAME,
            SESSION_AFTER_RENAME,
            RECORDING_AFTER_ENGINE_START,
            RECORDING_AFTER_ENGINE_STOP,
        ]
    }
}
