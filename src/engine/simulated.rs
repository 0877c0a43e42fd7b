//! In-memory pipeline engine
//!
//! Behaves like a well-mannered capture engine: running recording pipelines
//! grow their segment, graceful stop writes a finalized MP4 skeleton, hard
//! stop leaves an unfinalized one. Faults can be injected per camera.
//!
//! The engine is cheaply cloneable; clones share pipelines, which lets a test
//! drop a coordinator and build a new one against the same "hardware" to
//! exercise crash recovery.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::errors::{EngineError, EngineResult};
use super::pipeline::PipelineEngine;
use super::probe::{finalized_segment, unfinalized_segment};
use super::types::{
    CameraId, EngineEvent, EventCallback, PipelineHandle, PipelineKind, PipelineSpec,
    PipelineState, SegmentStats, StopOutcome,
};

/// Bytes a running pipeline "writes" between two stats queries
const GROWTH_PER_QUERY: u64 = 64 * 1024;

struct SimPipeline {
    camera_id: CameraId,
    spec: PipelineSpec,
    state: PipelineState,
    stats: Option<SegmentStats>,
    eos_callbacks: Vec<EventCallback>,
    error_callbacks: Vec<EventCallback>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    pipelines: HashMap<PipelineHandle, SimPipeline>,
    start_calls: u64,
    fail_start: HashSet<CameraId>,
    hang_on_stop: HashSet<CameraId>,
    fail_stop: HashSet<CameraId>,
    stalled: HashSet<CameraId>,
    skip_finalize: HashSet<CameraId>,
}

/// Shared-state simulated engine
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedEngine")
            .field("pipelines", &state.pipelines.len())
            .field("start_calls", &state.start_calls)
            .finish()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of successful `start` calls so far
    pub fn start_calls(&self) -> u64 {
        self.lock().start_calls
    }

    /// Make `start` fail for this camera
    pub fn fail_start(&self, camera_id: CameraId) {
        self.lock().fail_start.insert(camera_id);
    }

    /// Undo every injected fault
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.fail_start.clear();
        state.hang_on_stop.clear();
        state.fail_stop.clear();
        state.stalled.clear();
        state.skip_finalize.clear();
    }

    /// Make `stop` for this camera run into its timeout
    pub fn hang_on_stop(&self, camera_id: CameraId) {
        self.lock().hang_on_stop.insert(camera_id);
    }

    /// Make `stop` for this camera fail outright
    pub fn fail_stop(&self, camera_id: CameraId) {
        self.lock().fail_stop.insert(camera_id);
    }

    /// Stop growing this camera's segment
    pub fn stall(&self, camera_id: CameraId) {
        self.lock().stalled.insert(camera_id);
    }

    /// Graceful stop for this camera acknowledges EOS but writes a truncated file
    pub fn skip_finalize(&self, camera_id: CameraId) {
        self.lock().skip_finalize.insert(camera_id);
    }

    /// Forget every pipeline, as if the engine itself had restarted
    pub fn forget_pipelines(&self) {
        self.lock().pipelines.clear();
    }

    /// Pipelines the engine still tracks, running or not
    pub fn pipeline_count(&self) -> usize {
        self.lock().pipelines.len()
    }

    /// End a running pipeline's stream on its own, as when the source
    /// closes, and notify end-of-stream listeners
    pub fn end_stream(&self, handle: PipelineHandle) {
        let fired = {
            let mut state = self.lock();
            state
                .pipelines
                .get_mut(&handle)
                .filter(|p| p.state == PipelineState::Running)
                .map(|p| {
                    p.state = PipelineState::Stopped;
                    (
                        p.eos_callbacks.clone(),
                        EngineEvent::Eos {
                            camera_id: p.camera_id,
                            handle,
                        },
                    )
                })
        };
        if let Some((callbacks, event)) = fired {
            for cb in callbacks {
                cb(event.clone());
            }
        }
    }

    /// Mark a pipeline failed and notify error listeners
    pub fn inject_error(&self, handle: PipelineHandle, message: &str) {
        let fired = {
            let mut state = self.lock();
            state.pipelines.get_mut(&handle).map(|p| {
                p.state = PipelineState::Error;
                (
                    p.error_callbacks.clone(),
                    EngineEvent::Error {
                        camera_id: p.camera_id,
                        handle,
                        message: message.to_string(),
                    },
                )
            })
        };
        if let Some((callbacks, event)) = fired {
            for cb in callbacks {
                cb(event.clone());
            }
        }
    }

    /// Handles of running pipelines of `kind`, sorted
    pub fn running(&self, kind: PipelineKind) -> Vec<(CameraId, PipelineHandle)> {
        let state = self.lock();
        let mut running: Vec<_> = state
            .pipelines
            .iter()
            .filter(|(_, p)| p.state == PipelineState::Running && p.spec.kind == kind)
            .map(|(h, p)| (p.camera_id, *h))
            .collect();
        running.sort();
        running
    }

    fn write_output(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, bytes) {
            warn!(path = %path.display(), error = %e, "simulated engine could not write output");
        }
    }
}

#[async_trait]
impl PipelineEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(
        &self,
        camera_id: CameraId,
        spec: &PipelineSpec,
    ) -> EngineResult<PipelineHandle> {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = PipelineHandle(state.next_handle);
        state.pipelines.insert(
            handle,
            SimPipeline {
                camera_id,
                spec: spec.clone(),
                state: PipelineState::Ready,
                stats: None,
                eos_callbacks: Vec::new(),
                error_callbacks: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: PipelineHandle) -> EngineResult<()> {
        let output = {
            let mut state = self.lock();
            let fail = state.fail_start.clone();
            let pipeline = state
                .pipelines
                .get_mut(&handle)
                .ok_or(EngineError::UnknownHandle(handle))?;

            if fail.contains(&pipeline.camera_id) {
                pipeline.state = PipelineState::Error;
                return Err(EngineError::Rejected {
                    camera_id: pipeline.camera_id,
                    reason: "device busy".to_string(),
                });
            }
            if !matches!(pipeline.state, PipelineState::Ready | PipelineState::Stopped) {
                return Err(EngineError::InvalidState {
                    handle,
                    state: pipeline.state,
                    op: "start",
                });
            }

            pipeline.state = PipelineState::Running;
            pipeline.stats = Some(SegmentStats {
                bytes: 0,
                modified_at: Utc::now(),
            });
            let output = pipeline.spec.output.clone();
            state.start_calls += 1;
            output
        };

        if let Some(path) = output {
            Self::write_output(&path, &unfinalized_segment(0));
        }
        Ok(())
    }

    async fn stop(
        &self,
        handle: PipelineHandle,
        graceful: bool,
        timeout: Duration,
    ) -> EngineResult<StopOutcome> {
        let (camera_id, was_running, hang, skip_finalize, output, bytes) = {
            let state = self.lock();
            let pipeline = state
                .pipelines
                .get(&handle)
                .ok_or(EngineError::UnknownHandle(handle))?;
            if state.fail_stop.contains(&pipeline.camera_id) {
                return Err(EngineError::Rejected {
                    camera_id: pipeline.camera_id,
                    reason: "stop refused".to_string(),
                });
            }
            (
                pipeline.camera_id,
                pipeline.state == PipelineState::Running,
                state.hang_on_stop.contains(&pipeline.camera_id),
                state.skip_finalize.contains(&pipeline.camera_id),
                pipeline.spec.output.clone(),
                pipeline.stats.map(|s| s.bytes).unwrap_or(0),
            )
        };

        if !was_running {
            return Ok(StopOutcome::default());
        }

        let outcome = if hang {
            tokio::time::sleep(timeout).await;
            StopOutcome::timed_out()
        } else if graceful {
            StopOutcome {
                eos_received: true,
                finalized: !skip_finalize,
                timed_out: false,
            }
        } else {
            StopOutcome::default()
        };

        if let Some(path) = &output {
            let payload = (bytes as usize).min(64 * 1024);
            if outcome.finalized {
                Self::write_output(path, &finalized_segment(payload));
            } else {
                Self::write_output(path, &unfinalized_segment(payload));
            }
        }

        let callbacks = {
            let mut state = self.lock();
            match state.pipelines.get_mut(&handle) {
                Some(pipeline) => {
                    pipeline.state = PipelineState::Stopped;
                    pipeline.eos_callbacks.clone()
                }
                None => Vec::new(),
            }
        };
        if outcome.eos_received {
            let event = EngineEvent::Eos { camera_id, handle };
            for cb in callbacks {
                cb(event.clone());
            }
        }

        Ok(outcome)
    }

    fn release(&self, handle: PipelineHandle) {
        self.lock().pipelines.remove(&handle);
    }

    async fn query_state(&self, handle: PipelineHandle) -> PipelineState {
        self.lock()
            .pipelines
            .get(&handle)
            .map(|p| p.state)
            .unwrap_or(PipelineState::Unknown)
    }

    fn on_eos(&self, handle: PipelineHandle, callback: EventCallback) {
        if let Some(p) = self.lock().pipelines.get_mut(&handle) {
            p.eos_callbacks.push(callback);
        }
    }

    fn on_error(&self, handle: PipelineHandle, callback: EventCallback) {
        if let Some(p) = self.lock().pipelines.get_mut(&handle) {
            p.error_callbacks.push(callback);
        }
    }

    async fn segment_stats(&self, handle: PipelineHandle) -> Option<SegmentStats> {
        let mut state = self.lock();
        let stalled = state.stalled.clone();
        let pipeline = state.pipelines.get_mut(&handle)?;
        let stats = pipeline.stats.as_mut()?;

        if pipeline.state == PipelineState::Running && !stalled.contains(&pipeline.camera_id) {
            stats.bytes += GROWTH_PER_QUERY;
            stats.modified_at = Utc::now();
        }
        Some(*stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IntegrityProbe, Mp4StructureProbe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_graceful_stop_finalizes_output() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedEngine::new();
        let out = dir.path().join("s1/cam0_seg0.mp4");

        let handle = engine
            .create(0, &PipelineSpec::recording("/dev/video0", out.clone()))
            .await
            .unwrap();
        engine.start(handle).await.unwrap();
        engine.segment_stats(handle).await;

        let outcome = engine
            .stop(handle, true, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.eos_received && outcome.finalized && !outcome.timed_out);
        assert!(Mp4StructureProbe::default().probe(&out).await.ok);
    }

    #[tokio::test]
    async fn test_hard_stop_leaves_unfinalized_output() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedEngine::new();
        let out = dir.path().join("cam0.mp4");

        let handle = engine
            .create(0, &PipelineSpec::recording("/dev/video0", out.clone()))
            .await
            .unwrap();
        engine.start(handle).await.unwrap();
        engine.segment_stats(handle).await;
        engine
            .stop(handle, false, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!Mp4StructureProbe::default().probe(&out).await.ok);
    }

    #[tokio::test]
    async fn test_hang_on_stop_times_out() {
        let engine = SimulatedEngine::new();
        engine.hang_on_stop(1);
        let handle = engine
            .create(1, &PipelineSpec::preview("/dev/video1"))
            .await
            .unwrap();
        engine.start(handle).await.unwrap();

        let outcome = engine
            .stop(handle, true, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(engine.query_state(handle).await, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_fail_start_and_counters() {
        let engine = SimulatedEngine::new();
        engine.fail_start(1);

        let ok = engine.create(0, &PipelineSpec::preview("a")).await.unwrap();
        let bad = engine.create(1, &PipelineSpec::preview("b")).await.unwrap();
        engine.start(ok).await.unwrap();
        assert!(engine.start(bad).await.is_err());

        assert_eq!(engine.start_calls(), 1);
        assert_eq!(engine.running(PipelineKind::Preview), vec![(0, ok)]);
    }

    #[tokio::test]
    async fn test_stall_freezes_growth() {
        let engine = SimulatedEngine::new();
        let handle = engine.create(0, &PipelineSpec::preview("a")).await.unwrap();
        engine.start(handle).await.unwrap();

        let a = engine.segment_stats(handle).await.unwrap();
        let b = engine.segment_stats(handle).await.unwrap();
        assert!(b.bytes > a.bytes);

        engine.stall(0);
        let c = engine.segment_stats(handle).await.unwrap();
        assert_eq!(c.bytes, b.bytes);
    }

    #[tokio::test]
    async fn test_callbacks_fire() {
        let engine = SimulatedEngine::new();
        let handle = engine.create(0, &PipelineSpec::preview("a")).await.unwrap();
        engine.start(handle).await.unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        engine.on_error(
            handle,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        engine.inject_error(handle, "sensor lost");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(engine.query_state(handle).await, PipelineState::Error);
    }

    #[tokio::test]
    async fn test_release_and_end_stream() {
        let engine = SimulatedEngine::new();
        let handle = engine.create(0, &PipelineSpec::preview("a")).await.unwrap();
        engine.start(handle).await.unwrap();

        let eos = Arc::new(AtomicUsize::new(0));
        let seen = eos.clone();
        engine.on_eos(
            handle,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        engine.end_stream(handle);
        assert_eq!(eos.load(Ordering::SeqCst), 1);
        assert_eq!(engine.query_state(handle).await, PipelineState::Stopped);

        engine.release(handle);
        assert_eq!(engine.pipeline_count(), 0);
        assert!(engine.stop(handle, false, Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_forget_pipelines() {
        let engine = SimulatedEngine::new();
        let handle = engine.create(0, &PipelineSpec::preview("a")).await.unwrap();
        engine.forget_pipelines();
        assert_eq!(engine.query_state(handle).await, PipelineState::Unknown);
    }
}
