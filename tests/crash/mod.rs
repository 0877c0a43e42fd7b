//! Crash testing framework for dualcam
//!
//! This module provides:
//! - Crash injection at the durable-write and engine crash points
//! - Subprocess management (the test binary re-executes itself)
//! - Post-crash validation of the token and session records

pub mod harness;
pub mod scenarios;
pub mod utils;

pub use harness::*;
pub use utils::*;

// Integration tests run via `cargo test --test crash_tests`
