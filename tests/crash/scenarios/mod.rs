//! Crash scenarios
//!
//! Each scenario kills a child mid-operation, then boots a fresh
//! coordinator over the same data dir and checks what recovery made of it.
//! `resume` covers restarts where the engine outlived the coordinator.

mod recording;
mod resume;
mod session;
mod token;
