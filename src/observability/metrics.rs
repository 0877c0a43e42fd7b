//! Metrics registry
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Registry of all operational counters.
///
/// Relaxed ordering throughout; the values are for reporting only.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    locks_granted: AtomicU64,
    locks_denied: AtomicU64,
    locks_reclaimed: AtomicU64,
    recordings_started: AtomicU64,
    recordings_stopped: AtomicU64,
    recordings_failed: AtomicU64,
    integrity_failures: AtomicU64,
    engine_timeouts: AtomicU64,
    previews_started: AtomicU64,
    commands_executed: AtomicU64,
    duplicate_commands: AtomicU64,
    connections_opened: AtomicU64,
    health_recoveries: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Lock metrics

    pub fn increment_locks_granted(&self) {
        self.locks_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_locks_denied(&self) {
        self.locks_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_locks_reclaimed(&self) {
        self.locks_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    // Recording metrics

    pub fn increment_recordings_started(&self) {
        self.recordings_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recordings_stopped(&self) {
        self.recordings_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recordings_failed(&self) {
        self.recordings_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_integrity_failures(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_engine_timeouts(&self) {
        self.engine_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_health_recoveries(&self) {
        self.health_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    // Preview metrics

    pub fn increment_previews_started(&self) {
        self.previews_started.fetch_add(1, Ordering::Relaxed);
    }

    // Command plane metrics

    pub fn increment_commands_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicate_commands(&self) {
        self.duplicate_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            locks_denied: self.locks_denied.load(Ordering::Relaxed),
            locks_reclaimed: self.locks_reclaimed.load(Ordering::Relaxed),
            recordings_started: self.recordings_started.load(Ordering::Relaxed),
            recordings_stopped: self.recordings_stopped.load(Ordering::Relaxed),
            recordings_failed: self.recordings_failed.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            engine_timeouts: self.engine_timeouts.load(Ordering::Relaxed),
            previews_started: self.previews_started.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            duplicate_commands: self.duplicate_commands.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            health_recoveries: self.health_recoveries.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub locks_granted: u64,
    pub locks_denied: u64,
    pub locks_reclaimed: u64,
    pub recordings_started: u64,
    pub recordings_stopped: u64,
    pub recordings_failed: u64,
    pub integrity_failures: u64,
    pub engine_timeouts: u64,
    pub previews_started: u64,
    pub commands_executed: u64,
    pub duplicate_commands: u64,
    pub connections_opened: u64,
    pub health_recoveries: u64,
}
