//! Exclusivity token
//!
//! The single durable record of which capture mode currently owns the camera
//! hardware. At most one non-idle mode is active system-wide at any time.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Capture mode holding the camera hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Idle,
    Preview,
    Recording,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Preview => "preview",
            Mode::Recording => "recording",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Mode::Idle)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable exclusivity token.
///
/// `holder_id` identifies the logical holder (stable across restarts of the
/// coordinator); `holder_pid` is the process that last confirmed the hold and
/// is what liveness checks look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusivityToken {
    pub mode: Mode,
    pub holder_id: Option<String>,
    pub holder_pid: Option<u32>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub force_flag: bool,
}

impl Default for ExclusivityToken {
    fn default() -> Self {
        Self::idle()
    }
}

impl ExclusivityToken {
    /// The unheld token
    pub fn idle() -> Self {
        Self {
            mode: Mode::Idle,
            holder_id: None,
            holder_pid: None,
            acquired_at: None,
            force_flag: false,
        }
    }

    /// A freshly granted hold
    pub fn held(mode: Mode, holder_id: &str, holder_pid: u32, force: bool) -> Self {
        Self {
            mode,
            holder_id: Some(holder_id.to_string()),
            holder_pid: Some(holder_pid),
            acquired_at: Some(Utc::now()),
            force_flag: force,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.mode.is_idle()
    }

    /// True if `holder_id` holds `mode`
    pub fn is_held_by(&self, mode: Mode, holder_id: &str) -> bool {
        self.mode == mode && self.holder_id.as_deref() == Some(holder_id)
    }

    /// Time since the hold was granted
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.acquired_at.map(|at| now - at)
    }

    /// Holder name for messages
    pub fn holder_label(&self) -> String {
        self.holder_id.clone().unwrap_or_else(|| "<none>".to_string())
    }
}
