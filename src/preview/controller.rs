//! Preview Controller
//!
//! Per-camera lifecycle `Idle → Starting → Active → Stopping → Idle`.
//!
//! - `start` acquires the preview token without force; it is denied while
//!   recording holds the hardware.
//! - `stop` is a hard stop with a short bound. No end-of-stream wait: under
//!   rapid start/stop cycling a finalization wait races the muxer.
//! - The token is released when the last active camera stops.
//!
//! Preview sessions are ephemeral and not persisted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::config::{CameraConfig, CoordinatorConfig};
use crate::engine::{CameraId, PipelineEngine, PipelineHandle, PipelineSpec};
use crate::errors::ErrorKind;
use crate::lock::{LockManager, Mode, ReleaseOutcome};
use crate::observability::{ActivityLog, Event, MetricsRegistry};

/// Per-camera preview state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// One camera's preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewSession {
    pub camera_id: CameraId,
    pub state: PreviewState,
    pub started_at: Option<DateTime<Utc>>,
    pub pipeline_ref: Option<PipelineHandle>,
    pub last_error: Option<String>,
}

impl PreviewSession {
    fn idle(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            state: PreviewState::Idle,
            started_at: None,
            pipeline_ref: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub cameras: Vec<CameraConfig>,
    pub holder_id: String,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl PreviewSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            cameras: config.cameras.clone(),
            holder_id: format!("{}:preview", config.node_id),
            start_timeout: Duration::from_millis(config.preview.start_timeout_ms),
            stop_timeout: Duration::from_millis(config.preview.stop_timeout_ms),
        }
    }
}

/// Result of a preview operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewReport {
    pub success: bool,
    pub reason: String,
    pub error: Option<ErrorKind>,
    pub started: Vec<CameraId>,
    pub stopped: Vec<CameraId>,
    pub failed: Vec<CameraId>,
    /// Cameras whose hard stop did not confirm within the bound
    pub timed_out: Vec<CameraId>,
    pub cameras: Vec<PreviewSession>,
    pub holder: Option<String>,
    pub force_would_succeed: Option<bool>,
    pub lock_released: bool,
}

impl PreviewReport {
    fn new(success: bool, reason: impl Into<String>, error: Option<ErrorKind>) -> Self {
        Self {
            success,
            reason: reason.into(),
            error,
            started: Vec::new(),
            stopped: Vec::new(),
            failed: Vec::new(),
            timed_out: Vec::new(),
            cameras: Vec::new(),
            holder: None,
            force_would_succeed: None,
            lock_released: false,
        }
    }
}

pub struct PreviewController {
    settings: PreviewSettings,
    lock: Arc<LockManager>,
    engine: Arc<dyn PipelineEngine>,
    sessions: Mutex<BTreeMap<CameraId, PreviewSession>>,
    activity: Arc<ActivityLog>,
    metrics: Arc<MetricsRegistry>,
}

impl PreviewController {
    pub fn new(
        settings: PreviewSettings,
        lock: Arc<LockManager>,
        engine: Arc<dyn PipelineEngine>,
        activity: Arc<ActivityLog>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let sessions = settings
            .cameras
            .iter()
            .map(|c| (c.id, PreviewSession::idle(c.id)))
            .collect();
        Self {
            settings,
            lock,
            engine,
            sessions: Mutex::new(sessions),
            activity,
            metrics,
        }
    }

    fn scope(&self, camera_id: Option<CameraId>) -> Result<Vec<&CameraConfig>, PreviewReport> {
        match camera_id {
            None => Ok(self.settings.cameras.iter().collect()),
            Some(id) => match self.settings.cameras.iter().find(|c| c.id == id) {
                Some(camera) => Ok(vec![camera]),
                None => Err(PreviewReport::new(
                    false,
                    format!("unknown camera id {}", id),
                    Some(ErrorKind::Validation),
                )),
            },
        }
    }

    /// Start preview on one camera, or all when `camera_id` is `None`.
    pub async fn start(&self, camera_id: Option<CameraId>) -> PreviewReport {
        let cameras = match self.scope(camera_id) {
            Ok(cameras) => cameras,
            Err(report) => return report,
        };
        let mut sessions = self.sessions.lock().await;

        let targets: Vec<&CameraConfig> = cameras
            .into_iter()
            .filter(|c| {
                sessions
                    .get(&c.id)
                    .map(|s| s.state != PreviewState::Active)
                    .unwrap_or(true)
            })
            .collect();
        if targets.is_empty() {
            let mut report = PreviewReport::new(true, "preview already active", None);
            report.cameras = sessions.values().cloned().collect();
            return report;
        }

        let holder_id = &self.settings.holder_id;
        let grant = match self.lock.acquire_async(Mode::Preview, holder_id, false).await {
            Ok(grant) => grant,
            Err(e) => {
                return PreviewReport::new(
                    false,
                    format!("exclusivity token unavailable: {}", e),
                    Some(ErrorKind::Storage),
                )
            }
        };
        if let Some(denial) = grant.denial() {
            let mut report = PreviewReport::new(
                false,
                format!("{}; preview never forces", denial.reason),
                Some(ErrorKind::ResourceConflict),
            );
            report.holder = Some(denial.holder_id.clone());
            report.force_would_succeed = Some(false);
            report.cameras = sessions.values().cloned().collect();
            self.activity.record(Event::PreviewDenied, report.reason.clone());
            return report;
        }

        let mut report = PreviewReport::new(true, "preview started", None);
        for camera in targets {
            let session = sessions
                .entry(camera.id)
                .or_insert_with(|| PreviewSession::idle(camera.id));
            session.state = PreviewState::Starting;

            match self.launch(camera).await {
                Ok(handle) => {
                    session.state = PreviewState::Active;
                    session.started_at = Some(Utc::now());
                    session.pipeline_ref = Some(handle);
                    session.last_error = None;
                    self.metrics.increment_previews_started();
                    report.started.push(camera.id);
                }
                Err(reason) => {
                    *session = PreviewSession::idle(camera.id);
                    session.last_error = Some(reason);
                    report.failed.push(camera.id);
                }
            }
        }

        if !report.started.is_empty() {
            self.activity.record(
                Event::PreviewStarted,
                format!("preview active on camera(s) {:?}", report.started),
            );
        }
        if !report.failed.is_empty() {
            let reasons: Vec<String> = report
                .failed
                .iter()
                .filter_map(|id| sessions.get(id))
                .filter_map(|s| {
                    s.last_error
                        .as_ref()
                        .map(|e| format!("camera {}: {}", s.camera_id, e))
                })
                .collect();
            report.reason = reasons.join("; ");
            if report.started.is_empty() {
                report.success = false;
                report.error = Some(ErrorKind::Engine);
            }
        }

        if !sessions.values().any(|s| s.state == PreviewState::Active) {
            report.lock_released = self.release_lock().await;
        }
        report.cameras = sessions.values().cloned().collect();
        report
    }

    async fn launch(&self, camera: &CameraConfig) -> Result<PipelineHandle, String> {
        let bound = self.settings.start_timeout;
        let spec = PipelineSpec::preview(camera.device.clone());

        let handle = match timeout(bound, self.engine.create(camera.id, &spec)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("engine did not create pipeline within {:?}", bound)),
        };

        // Recording may have taken the hardware while earlier cameras started.
        let holds = match self.lock.holds(Mode::Preview, &self.settings.holder_id) {
            Ok(true) => Ok(()),
            Ok(false) => Err("preview token lost before start".to_string()),
            Err(e) => Err(format!("cannot read preview token: {}", e)),
        };
        if let Err(reason) = holds {
            self.engine.release(handle);
            return Err(reason);
        }

        let reason = match timeout(bound, self.engine.start(handle)).await {
            Ok(Ok(())) => return Ok(handle),
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                self.hard_stop(handle).await;
                format!("engine did not confirm start within {:?}", bound)
            }
        };
        self.engine.release(handle);
        Err(reason)
    }

    async fn hard_stop(&self, handle: PipelineHandle) -> bool {
        let bound = self.settings.stop_timeout;
        match timeout(bound * 2, self.engine.stop(handle, false, bound)).await {
            Ok(Ok(outcome)) => !outcome.timed_out,
            Ok(Err(e)) => {
                warn!(%handle, error = %e, "preview stop failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Hard-stop preview on one camera, or all when `camera_id` is `None`.
    pub async fn stop(&self, camera_id: Option<CameraId>) -> PreviewReport {
        let cameras = match self.scope(camera_id) {
            Ok(cameras) => cameras,
            Err(report) => return report,
        };
        let mut sessions = self.sessions.lock().await;

        let mut report = PreviewReport::new(true, "preview stopped", None);
        for camera in cameras {
            let Some(session) = sessions.get_mut(&camera.id) else {
                continue;
            };
            if session.state != PreviewState::Active {
                continue;
            }
            session.state = PreviewState::Stopping;
            if let Some(handle) = session.pipeline_ref {
                if !self.hard_stop(handle).await {
                    session.last_error = Some("hard stop timed out".to_string());
                    report.timed_out.push(camera.id);
                }
                self.engine.release(handle);
            }
            session.state = PreviewState::Idle;
            session.pipeline_ref = None;
            session.started_at = None;
            report.stopped.push(camera.id);
        }

        if report.stopped.is_empty() {
            report.reason = "preview not active".to_string();
        } else if !report.timed_out.is_empty() {
            report.success = false;
            report.error = Some(ErrorKind::EngineTimeout);
            report.reason = format!(
                "hard stop timed out on camera(s) {:?}; pipeline(s) torn down",
                report.timed_out
            );
            self.activity.record(Event::PreviewStopped, report.reason.clone());
        } else {
            self.activity.record(
                Event::PreviewStopped,
                format!("preview stopped on camera(s) {:?}", report.stopped),
            );
        }

        if !sessions.values().any(|s| s.state == PreviewState::Active) {
            report.lock_released = self.release_lock().await;
        }
        report.cameras = sessions.values().cloned().collect();
        report
    }

    /// `stop` then `start` over the same scope
    pub async fn restart(&self, camera_id: Option<CameraId>) -> PreviewReport {
        let stopped = self.stop(camera_id).await;
        if stopped.error == Some(ErrorKind::Validation) {
            return stopped;
        }
        let mut report = self.start(camera_id).await;
        report.stopped = stopped.stopped;
        report
    }

    /// Tear down every preview pipeline because recording took the hardware.
    ///
    /// The token is not released: it already belongs to recording.
    pub async fn preempt(&self) -> Vec<CameraId> {
        let mut sessions = self.sessions.lock().await;
        let mut stopped = Vec::new();

        for session in sessions.values_mut() {
            if !matches!(session.state, PreviewState::Active | PreviewState::Starting) {
                continue;
            }
            if let Some(handle) = session.pipeline_ref {
                if !self.hard_stop(handle).await {
                    warn!(%handle, "preempted preview did not confirm stop");
                }
                self.engine.release(handle);
            }
            *session = PreviewSession::idle(session.camera_id);
            stopped.push(session.camera_id);
        }

        if !stopped.is_empty() {
            self.activity.record(
                Event::PreviewPreempted,
                format!("recording preempted preview on camera(s) {:?}", stopped),
            );
        }
        stopped
    }

    pub async fn is_active(&self) -> bool {
        self.sessions
            .lock()
            .await
            .values()
            .any(|s| s.state != PreviewState::Idle)
    }

    pub async fn status(&self) -> Vec<PreviewSession> {
        self.sessions.lock().await.values().cloned().collect()
    }

    async fn release_lock(&self) -> bool {
        match self
            .lock
            .release_async(Mode::Preview, &self.settings.holder_id)
            .await
        {
            Ok(ReleaseOutcome::Released) | Ok(ReleaseOutcome::AlreadyIdle) => true,
            Ok(ReleaseOutcome::NotHolder { .. }) => false,
            Err(e) => {
                warn!(error = %e, "failed to release preview lock");
                false
            }
        }
    }
}

impl std::fmt::Debug for PreviewController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewController")
            .field("engine", &self.engine.name())
            .field("holder_id", &self.settings.holder_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PipelineKind, SimulatedEngine};
    use crate::lock::{LockManagerConfig, ProcessLiveness};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (PreviewController, Arc<LockManager>, SimulatedEngine) {
        let config = CoordinatorConfig::rooted_at(dir.path());
        let activity = Arc::new(ActivityLog::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let lock = Arc::new(LockManager::open(
            &config.state_dir,
            LockManagerConfig::default(),
            Arc::new(ProcessLiveness),
            activity.clone(),
            metrics.clone(),
        ));
        let engine = SimulatedEngine::new();
        let preview = PreviewController::new(
            PreviewSettings::from_config(&config),
            lock.clone(),
            Arc::new(engine.clone()),
            activity,
            metrics,
        );
        (preview, lock, engine)
    }

    #[tokio::test]
    async fn test_start_all_and_stop_all() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);

        let report = preview.start(None).await;
        assert!(report.success, "{}", report.reason);
        assert_eq!(report.started, vec![0, 1]);
        assert_eq!(lock.query().unwrap().mode, Mode::Preview);
        assert_eq!(engine.running(PipelineKind::Preview).len(), 2);

        let report = preview.stop(None).await;
        assert_eq!(report.stopped, vec![0, 1]);
        assert!(report.lock_released);
        assert_eq!(lock.query().unwrap().mode, Mode::Idle);
        assert!(engine.running(PipelineKind::Preview).is_empty());
    }

    #[tokio::test]
    async fn test_token_released_only_after_last_camera() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, _engine) = setup(&dir);

        preview.start(None).await;
        let report = preview.stop(Some(0)).await;
        assert!(!report.lock_released);
        assert_eq!(lock.query().unwrap().mode, Mode::Preview);

        let report = preview.stop(Some(1)).await;
        assert!(report.lock_released);
        assert_eq!(lock.query().unwrap().mode, Mode::Idle);
    }

    #[tokio::test]
    async fn test_unknown_camera_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);

        let report = preview.start(Some(9)).await;
        assert!(!report.success);
        assert_eq!(report.error, Some(ErrorKind::Validation));
        assert_eq!(lock.query().unwrap().mode, Mode::Idle);
        assert_eq!(engine.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_denied_while_recording() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);

        lock.acquire(Mode::Recording, "dualcam:recording", false)
            .unwrap();
        let report = preview.start(Some(0)).await;

        assert!(!report.success);
        assert_eq!(report.error, Some(ErrorKind::ResourceConflict));
        assert_eq!(report.holder.as_deref(), Some("dualcam:recording"));
        assert_eq!(engine.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_camera() {
        let dir = TempDir::new().unwrap();
        let (preview, _lock, engine) = setup(&dir);

        preview.start(Some(0)).await;
        let again = preview.start(Some(0)).await;
        assert!(again.success);
        assert!(again.started.is_empty());
        assert_eq!(engine.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_all_cameras_failing_releases_token() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);
        engine.fail_start(0);
        engine.fail_start(1);

        let report = preview.start(None).await;
        assert!(!report.success);
        assert_eq!(report.error, Some(ErrorKind::Engine));
        assert_eq!(report.failed, vec![0, 1]);
        assert_eq!(lock.query().unwrap().mode, Mode::Idle);
    }

    #[tokio::test]
    async fn test_restart_cycles_pipeline() {
        let dir = TempDir::new().unwrap();
        let (preview, _lock, engine) = setup(&dir);

        preview.start(Some(1)).await;
        let before = engine.running(PipelineKind::Preview);
        let report = preview.restart(Some(1)).await;

        assert!(report.success);
        assert_eq!(report.stopped, vec![1]);
        assert_eq!(report.started, vec![1]);
        assert_ne!(engine.running(PipelineKind::Preview), before);
    }

    #[tokio::test]
    async fn test_preempt_keeps_token() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);

        preview.start(None).await;
        lock.acquire(Mode::Recording, "dualcam:recording", false)
            .unwrap();
        let stopped = preview.preempt().await;

        assert_eq!(stopped, vec![0, 1]);
        assert!(!preview.is_active().await);
        assert!(engine.running(PipelineKind::Preview).is_empty());
        assert_eq!(lock.query().unwrap().mode, Mode::Recording);
    }

    #[tokio::test]
    async fn test_hard_stop_timeout_is_reported() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);

        preview.start(None).await;
        engine.hang_on_stop(0);
        let report = preview.stop(None).await;

        assert!(!report.success);
        assert_eq!(report.error, Some(ErrorKind::EngineTimeout));
        assert_eq!(report.timed_out, vec![0]);
        assert_eq!(report.stopped, vec![0, 1]);
        assert!(report.reason.contains("timed out"));
        // The token still goes back
        assert!(report.lock_released);
        assert_eq!(lock.query().unwrap().mode, Mode::Idle);
        assert!(!preview.is_active().await);
    }

    #[tokio::test]
    async fn test_stop_cycles_release_pipelines() {
        let dir = TempDir::new().unwrap();
        let (preview, lock, engine) = setup(&dir);

        for _ in 0..5 {
            preview.start(None).await;
            preview.stop(None).await;
        }
        assert_eq!(engine.pipeline_count(), 0);

        // Failed starts and preemption release too
        engine.fail_start(1);
        preview.start(None).await;
        assert_eq!(engine.pipeline_count(), 1);
        lock.acquire(Mode::Recording, "dualcam:recording", false)
            .unwrap();
        preview.preempt().await;
        assert_eq!(engine.pipeline_count(), 0);
    }
}
