//! Bounded in-memory activity log
//!
//! Keeps the most recent lifecycle events so remote clients can query
//! recent activity (`logs.get`) without touching the filesystem.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::events::Event;
use super::logger::{self, Severity};

/// Default number of retained entries
pub const DEFAULT_ACTIVITY_CAPACITY: usize = 500;

/// One recorded lifecycle event
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub event: String,
    pub severity: Severity,
    pub detail: String,
}

/// Ring buffer of recent activity.
///
/// Recording an entry also emits it through `tracing`.
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Log and retain an event
    pub fn record(&self, event: Event, detail: impl Into<String>) {
        let detail = detail.into();
        logger::emit(event, &detail);

        let entry = ActivityEntry {
            at: Utc::now(),
            event: event.as_str().to_string(),
            severity: event.severity(),
            detail,
        };

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Most recent entries, oldest first, at most `limit`
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        match self.entries.lock() {
            Ok(entries) => {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
