//! Pipeline engine boundary
//!
//! The media pipeline that captures, encodes and muxes video is an external
//! collaborator. This module defines how the coordinator talks to it
//! (`PipelineEngine`), how finalized output is validated (`IntegrityProbe`),
//! and ships two engines:
//!
//! - `ProcessEngine`: one child process per pipeline (ffmpeg and friends)
//! - `SimulatedEngine`: in-memory engine with fault injection

mod errors;
mod pipeline;
mod probe;
mod process;
mod simulated;
mod types;

pub use errors::{EngineError, EngineResult};
pub use pipeline::PipelineEngine;
pub use probe::{IntegrityProbe, Mp4StructureProbe, ProbeReport, DEFAULT_MAX_BOXES};
pub use process::{render_argv, ProcessEngine, ProcessEngineConfig};
pub use simulated::SimulatedEngine;
pub use types::{
    CameraId, EngineEvent, EventCallback, PipelineHandle, PipelineKind, PipelineSpec,
    PipelineState, SegmentStats, StopOutcome,
};
