//! The pipeline engine boundary
//!
//! The coordinator never captures or encodes video itself. It drives an
//! external engine through this trait and listens for asynchronous
//! end-of-stream and error notifications.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::EngineResult;
use super::types::{
    CameraId, EventCallback, PipelineHandle, PipelineSpec, PipelineState, SegmentStats,
    StopOutcome,
};

#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Build (but do not start) a pipeline for one camera
    async fn create(&self, camera_id: CameraId, spec: &PipelineSpec)
        -> EngineResult<PipelineHandle>;

    async fn start(&self, handle: PipelineHandle) -> EngineResult<()>;

    /// Stop a pipeline.
    ///
    /// `graceful` waits for end-of-stream so the muxer can finalize; a hard
    /// stop terminates promptly. Either way the wait is bounded by `timeout`.
    async fn stop(
        &self,
        handle: PipelineHandle,
        graceful: bool,
        timeout: Duration,
    ) -> EngineResult<StopOutcome>;

    /// Forget a pipeline and its callbacks. A pipeline still running is
    /// torn down. The handle reports `Unknown` afterwards.
    fn release(&self, handle: PipelineHandle);

    /// Current state; `Unknown` for handles the engine does not know
    async fn query_state(&self, handle: PipelineHandle) -> PipelineState;

    fn on_eos(&self, handle: PipelineHandle, callback: EventCallback);

    fn on_error(&self, handle: PipelineHandle, callback: EventCallback);

    /// Size and modification time of the pipeline's current output
    async fn segment_stats(&self, handle: PipelineHandle) -> Option<SegmentStats>;
}
