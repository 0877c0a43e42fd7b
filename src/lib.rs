//! dualcam - camera arbitration and recording lifecycle coordinator
//!
//! Two capture activities, live preview and recording, contend for the same
//! camera hardware. A durable exclusivity token decides which one holds it;
//! the recording controller drives sessions through a crash-recoverable
//! state machine; a WebSocket command plane lets remote clients drive both
//! with at-most-once command semantics.

pub mod cli;
pub mod command_plane;
pub mod config;
pub mod coordinator;
pub mod crash_point;
pub mod engine;
pub mod errors;
pub mod http_server;
pub mod lock;
pub mod observability;
pub mod preview;
pub mod recording;
pub mod store;
