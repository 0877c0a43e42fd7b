//! Observability subsystem
//!
//! - Structured logging through `tracing` (JSON or text)
//! - Typed lifecycle events with stable names
//! - Monotonic counters
//! - Bounded activity log for remote log queries
//!
//! # Usage
//!
//! ```ignore
//! use dualcam::observability::{ActivityLog, Event, MetricsRegistry};
//!
//! let activity = ActivityLog::default();
//! activity.record(Event::LockGranted, "recording granted to coordinator");
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_locks_granted();
//! ```

mod activity;
mod events;
mod logger;
mod metrics;

pub use activity::{ActivityEntry, ActivityLog, DEFAULT_ACTIVITY_CAPACITY};
pub use events::Event;
pub use logger::{emit, init_logging, LogFormat, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
