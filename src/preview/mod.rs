//! Preview Controller
//!
//! Low-latency live view per camera. Never forces the exclusivity token and
//! tears down with hard stops.

mod controller;

pub use controller::{
    PreviewController, PreviewReport, PreviewSession, PreviewSettings, PreviewState,
};
