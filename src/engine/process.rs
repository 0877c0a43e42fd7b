//! Child-process pipeline engine
//!
//! Each pipeline is one external process (typically ffmpeg or
//! gst-launch) built from an argv template:
//!
//! ```text
//! ["ffmpeg", "-f", "v4l2", "-i", "{device}", "-c:v", "h264_v4l2m2m", "{output}"]
//! ```
//!
//! Placeholders: `{camera}`, `{device}`, `{output}`.
//!
//! Graceful stop writes `q` to the child's stdin (ffmpeg's interactive quit,
//! which flushes and finalizes the container) and waits for exit. Hard stop
//! kills the child. All children are spawned with `kill_on_drop` so a
//! dropped engine never leaks capture processes holding the cameras.
//!
//! Handles are process-local: after a coordinator restart every persisted
//! handle reports `Unknown`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{info, warn};

use super::errors::{EngineError, EngineResult};
use super::pipeline::PipelineEngine;
use super::types::{
    CameraId, EngineEvent, EventCallback, PipelineHandle, PipelineKind, PipelineSpec,
    PipelineState, SegmentStats, StopOutcome,
};

/// Grace period for a killed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// argv templates for each pipeline kind
#[derive(Debug, Clone, Default)]
pub struct ProcessEngineConfig {
    pub recording_argv: Vec<String>,
    pub preview_argv: Vec<String>,
}

impl ProcessEngineConfig {
    fn template(&self, kind: PipelineKind) -> &[String] {
        match kind {
            PipelineKind::Recording => &self.recording_argv,
            PipelineKind::Preview => &self.preview_argv,
        }
    }
}

/// Substitute placeholders in an argv template
pub fn render_argv(template: &[String], camera_id: CameraId, spec: &PipelineSpec) -> Vec<String> {
    let camera = camera_id.to_string();
    let output = spec
        .output
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    template
        .iter()
        .map(|arg| {
            arg.replace("{camera}", &camera)
                .replace("{device}", &spec.device)
                .replace("{output}", &output)
        })
        .collect()
}

struct ProcessPipeline {
    camera_id: CameraId,
    spec: PipelineSpec,
    state: PipelineState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    eos_callbacks: Vec<EventCallback>,
    error_callbacks: Vec<EventCallback>,
}

impl ProcessPipeline {
    fn callbacks_for(&self, event: &EngineEvent) -> Vec<EventCallback> {
        match event {
            EngineEvent::Eos { .. } => self.eos_callbacks.clone(),
            EngineEvent::Error { .. } => self.error_callbacks.clone(),
        }
    }
}

/// Engine driving one child process per pipeline
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    next_handle: AtomicU64,
    pipelines: Mutex<HashMap<PipelineHandle, ProcessPipeline>>,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Pipelines the engine still tracks
    pub fn pipeline_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PipelineHandle, ProcessPipeline>> {
        self.pipelines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(callbacks: Vec<EventCallback>, event: EngineEvent) {
        for cb in callbacks {
            cb(event.clone());
        }
    }
}

#[async_trait]
impl PipelineEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(
        &self,
        camera_id: CameraId,
        spec: &PipelineSpec,
    ) -> EngineResult<PipelineHandle> {
        if self.config.template(spec.kind).is_empty() {
            return Err(EngineError::EmptyTemplate { kind: spec.kind });
        }

        let handle = PipelineHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.table().insert(
            handle,
            ProcessPipeline {
                camera_id,
                spec: spec.clone(),
                state: PipelineState::Ready,
                child: None,
                stdin: None,
                eos_callbacks: Vec::new(),
                error_callbacks: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: PipelineHandle) -> EngineResult<()> {
        let mut table = self.table();
        let pipeline = table
            .get_mut(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;

        if !matches!(pipeline.state, PipelineState::Ready | PipelineState::Stopped) {
            return Err(EngineError::InvalidState {
                handle,
                state: pipeline.state,
                op: "start",
            });
        }

        let argv = render_argv(
            self.config.template(pipeline.spec.kind),
            pipeline.camera_id,
            &pipeline.spec,
        );
        let (program, args) = argv.split_first().ok_or(EngineError::EmptyTemplate {
            kind: pipeline.spec.kind,
        })?;

        if let Some(parent) = pipeline.spec.output.as_ref().and_then(|p| p.parent()) {
            std::fs::create_dir_all(parent).map_err(|source| EngineError::Io { handle, source })?;
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                camera_id: pipeline.camera_id,
                kind: pipeline.spec.kind,
                source,
            })?;

        info!(
            camera_id = pipeline.camera_id,
            %handle,
            pid = child.id(),
            kind = %pipeline.spec.kind,
            "pipeline process started"
        );

        pipeline.stdin = child.stdin.take();
        pipeline.child = Some(child);
        pipeline.state = PipelineState::Running;
        Ok(())
    }

    async fn stop(
        &self,
        handle: PipelineHandle,
        graceful: bool,
        timeout: Duration,
    ) -> EngineResult<StopOutcome> {
        let (camera_id, child, stdin) = {
            let mut table = self.table();
            let pipeline = table
                .get_mut(&handle)
                .ok_or(EngineError::UnknownHandle(handle))?;
            (pipeline.camera_id, pipeline.child.take(), pipeline.stdin.take())
        };

        let Some(mut child) = child else {
            return Ok(StopOutcome::default());
        };

        let outcome = if graceful {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(b"q\n").await {
                    warn!(camera_id, %handle, error = %e, "failed to request graceful quit");
                }
                let _ = stdin.flush().await;
            }
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => StopOutcome {
                    eos_received: true,
                    finalized: status.success(),
                    timed_out: false,
                },
                Ok(Err(e)) => {
                    warn!(camera_id, %handle, error = %e, "wait on pipeline failed");
                    StopOutcome::default()
                }
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
                    StopOutcome::timed_out()
                }
            }
        } else {
            drop(stdin);
            let _ = child.start_kill();
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(_) => StopOutcome::default(),
                Err(_) => StopOutcome::timed_out(),
            }
        };

        let callbacks = {
            let mut table = self.table();
            match table.get_mut(&handle) {
                Some(pipeline) => {
                    pipeline.state = PipelineState::Stopped;
                    pipeline.eos_callbacks.clone()
                }
                None => Vec::new(),
            }
        };
        if outcome.eos_received {
            Self::dispatch(callbacks, EngineEvent::Eos { camera_id, handle });
        }

        Ok(outcome)
    }

    fn release(&self, handle: PipelineHandle) {
        // `kill_on_drop` takes down a child that is still running
        if let Some(pipeline) = self.table().remove(&handle) {
            if pipeline.child.is_some() {
                warn!(
                    camera_id = pipeline.camera_id,
                    %handle,
                    "released pipeline was still running"
                );
            }
        }
    }

    async fn query_state(&self, handle: PipelineHandle) -> PipelineState {
        let (state, fired) = {
            let mut table = self.table();
            let Some(pipeline) = table.get_mut(&handle) else {
                return PipelineState::Unknown;
            };

            let mut fired = None;
            if let Some(child) = pipeline.child.as_mut() {
                match child.try_wait() {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        let event = if status.success() {
                            pipeline.state = PipelineState::Stopped;
                            EngineEvent::Eos {
                                camera_id: pipeline.camera_id,
                                handle,
                            }
                        } else {
                            pipeline.state = PipelineState::Error;
                            EngineEvent::Error {
                                camera_id: pipeline.camera_id,
                                handle,
                                message: format!("pipeline process exited: {}", status),
                            }
                        };
                        pipeline.child = None;
                        pipeline.stdin = None;
                        fired = Some((pipeline.callbacks_for(&event), event));
                    }
                    Err(e) => {
                        pipeline.state = PipelineState::Error;
                        let event = EngineEvent::Error {
                            camera_id: pipeline.camera_id,
                            handle,
                            message: format!("cannot poll pipeline process: {}", e),
                        };
                        fired = Some((pipeline.callbacks_for(&event), event));
                    }
                }
            }
            (pipeline.state, fired)
        };

        if let Some((callbacks, event)) = fired {
            Self::dispatch(callbacks, event);
        }
        state
    }

    fn on_eos(&self, handle: PipelineHandle, callback: EventCallback) {
        if let Some(pipeline) = self.table().get_mut(&handle) {
            pipeline.eos_callbacks.push(callback);
        }
    }

    fn on_error(&self, handle: PipelineHandle, callback: EventCallback) {
        if let Some(pipeline) = self.table().get_mut(&handle) {
            pipeline.error_callbacks.push(callback);
        }
    }

    async fn segment_stats(&self, handle: PipelineHandle) -> Option<SegmentStats> {
        let output = self.table().get(&handle)?.spec.output.clone()?;
        let metadata = tokio::fs::metadata(&output).await.ok()?;
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Some(SegmentStats {
            bytes: metadata.len(),
            modified_at,
        })
    }
}
