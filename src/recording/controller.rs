//! Recording Lifecycle Controller
//!
//! State machine over one recording session:
//!
//! ```text
//! Idle → Starting → Recording → Stopping → Stopped | Failed → Idle
//!           └──────────────(start failure)──────────→ Failed
//! ```
//!
//! Every transition runs under the controller's own mutex, so the controller
//! is the single writer of the session and the serialization point for
//! concurrent commands. Every engine call is bounded by a timeout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use super::health::{GrowthTracker, HealthReport};
use super::session::{
    generate_session_id, is_valid_session_id, segment_path, CameraFailure, CameraRecord,
    CameraStopReport, RecordingSession, RecordingStatus, RecoveryOutcome, RecoveryReport,
    SessionState, StartReport, StopReport,
};
use crate::config::{CameraConfig, CoordinatorConfig};
use crate::crash_point::{maybe_crash, points};
use crate::engine::{
    CameraId, EngineEvent, EventCallback, IntegrityProbe, PipelineEngine, PipelineHandle,
    PipelineSpec, PipelineState, ProbeReport, StopOutcome,
};
use crate::errors::ErrorKind;
use crate::lock::{LockManager, Mode, ReleaseOutcome};
use crate::observability::{ActivityLog, Event, MetricsRegistry};
use crate::preview::PreviewController;
use crate::store::{DurableRecord, StoreResult};

const SESSION_FILE_NAME: &str = "session.json";

/// Slack on top of an engine's own stop bound before we give up on the call
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Recording controller tuning
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub state_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub cameras: Vec<CameraConfig>,
    pub holder_id: String,
    pub protection: Duration,
    pub require_all_cameras: bool,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub probe_timeout: Duration,
    pub stall_interval: Duration,
    pub max_recovery_attempts: u32,
}

impl RecordingSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            state_dir: config.state_dir.clone(),
            recordings_dir: config.recordings_dir.clone(),
            cameras: config.cameras.clone(),
            holder_id: format!("{}:recording", config.node_id),
            protection: Duration::from_secs(config.recording.protection_seconds),
            require_all_cameras: config.recording.require_all_cameras,
            start_timeout: Duration::from_millis(config.recording.start_timeout_ms),
            stop_timeout: Duration::from_millis(config.recording.stop_timeout_ms),
            probe_timeout: Duration::from_millis(config.recording.probe_timeout_ms),
            stall_interval: Duration::from_secs(config.health.stall_interval_secs),
            max_recovery_attempts: config.health.max_recovery_attempts,
        }
    }
}

pub(super) struct Inner {
    pub(super) session: Option<RecordingSession>,
    pub(super) growth: HashMap<CameraId, GrowthTracker>,
    pub(super) last_health: Option<HealthReport>,
    last_report: Option<StopReport>,
    epoch: u64,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

pub struct RecordingController {
    pub(super) settings: RecordingSettings,
    pub(super) lock: Arc<LockManager>,
    pub(super) engine: Arc<dyn PipelineEngine>,
    probe: Arc<dyn IntegrityProbe>,
    preview: Arc<PreviewController>,
    record: DurableRecord<RecordingSession>,
    pub(super) inner: Mutex<Inner>,
    status_tx: watch::Sender<RecordingStatus>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_notify: Arc<Notify>,
    pub(super) activity: Arc<ActivityLog>,
    pub(super) metrics: Arc<MetricsRegistry>,
}

pub(super) fn chrono_span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl RecordingController {
    pub fn new(
        settings: RecordingSettings,
        lock: Arc<LockManager>,
        engine: Arc<dyn PipelineEngine>,
        probe: Arc<dyn IntegrityProbe>,
        preview: Arc<PreviewController>,
        activity: Arc<ActivityLog>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let record = DurableRecord::new(&settings.state_dir, SESSION_FILE_NAME)
            .with_crash_points(points::SESSION_BEFORE_RENAME, points::SESSION_AFTER_RENAME);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(RecordingStatus::idle());

        Self {
            settings,
            lock,
            engine,
            probe,
            preview,
            record,
            inner: Mutex::new(Inner {
                session: None,
                growth: HashMap::new(),
                last_health: None,
                last_report: None,
                epoch: 0,
                events_rx,
            }),
            status_tx,
            events_tx,
            events_notify: Arc::new(Notify::new()),
            activity,
            metrics,
        }
    }

    /// Start a recording session.
    ///
    /// Repeating `start` with the active session id is an idempotent success
    /// that does not touch the engine. A different id is denied unless
    /// `force`, in which case the active session is force-stopped first.
    pub async fn start(&self, session_id: Option<String>, force: bool) -> StartReport {
        let mut inner = self.inner.lock().await;
        self.drain_events(&mut inner);

        if let Some(id) = &session_id {
            if !is_valid_session_id(id) {
                return StartReport::rejected(
                    ErrorKind::Validation,
                    format!("invalid session id '{}'", id),
                    Self::current_state(&inner),
                );
            }
        }

        let mut superseded = None;
        if let Some(active) = inner.session.as_ref() {
            if session_id.as_deref() == Some(active.session_id.as_str())
                && active.state == SessionState::Recording
            {
                self.activity.record(
                    Event::RecordingStartIdempotent,
                    format!("session '{}' already recording", active.session_id),
                );
                return StartReport {
                    success: true,
                    reason: format!("session '{}' already recording", active.session_id),
                    error: None,
                    session_id: Some(active.session_id.clone()),
                    state: active.state,
                    idempotent: true,
                    preempted_preview: false,
                    superseded_session: None,
                    started_cameras: active.started_cameras(),
                    failed_cameras: Vec::new(),
                    protected_until: Some(active.protected_until),
                    holder: Some(active.holder_id.clone()),
                    force_would_succeed: None,
                };
            }

            if !force {
                let mut report = StartReport::rejected(
                    ErrorKind::ResourceConflict,
                    format!(
                        "session '{}' is {}; force would supersede it",
                        active.session_id, active.state
                    ),
                    active.state,
                );
                report.session_id = Some(active.session_id.clone());
                report.holder = Some(active.holder_id.clone());
                report.force_would_succeed = Some(true);
                self.activity
                    .record(Event::RecordingStartFailed, report.reason.clone());
                return report;
            }

            superseded = Some(active.session_id.clone());
            self.stop_locked(&mut inner, true).await;
        }

        let session_id = session_id.unwrap_or_else(generate_session_id);
        let holder_id = self.settings.holder_id.clone();

        let grant = match self
            .lock
            .acquire_async(Mode::Recording, &holder_id, force)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                return StartReport::rejected(
                    ErrorKind::Storage,
                    format!("exclusivity token unavailable: {}", e),
                    SessionState::Idle,
                )
            }
        };
        if let Some(denial) = grant.denial() {
            let mut report = StartReport::rejected(
                ErrorKind::ResourceConflict,
                denial.reason.clone(),
                SessionState::Idle,
            );
            report.holder = Some(denial.holder_id.clone());
            report.force_would_succeed = Some(denial.force_would_succeed);
            self.activity
                .record(Event::RecordingStartFailed, report.reason.clone());
            return report;
        }

        // Recording has priority: whatever preview holds goes down before
        // the recording pipelines start.
        let mut preempted_preview = grant.previous_mode() == Some(Mode::Preview);
        if preempted_preview || self.preview.is_active().await {
            let stopped = self.preview.preempt().await;
            preempted_preview |= !stopped.is_empty();
        }

        let now = Utc::now();
        let per_camera: BTreeMap<CameraId, CameraRecord> = self
            .settings
            .cameras
            .iter()
            .map(|camera| {
                let output = segment_path(&self.settings.recordings_dir, &session_id, camera.id, 0);
                (camera.id, CameraRecord::new(camera.id, output))
            })
            .collect();

        let mut session = RecordingSession {
            session_id: session_id.clone(),
            state: SessionState::Starting,
            holder_id,
            started_at: now,
            protected_until: now + chrono_span(self.settings.protection),
            per_camera,
            require_all_cameras: self.settings.require_all_cameras,
            force_requested: force,
            updated_at: now,
        };

        if let Err(e) = self.persist(&session) {
            let released = self.release_lock(&session.holder_id).await;
            let mut report = StartReport::rejected(
                ErrorKind::Storage,
                format!("cannot persist session '{}': {}", session_id, e),
                SessionState::Idle,
            );
            report.reason.push_str(if released {
                "; lock released"
            } else {
                "; lock release failed"
            });
            return report;
        }

        inner.epoch += 1;
        inner.growth.clear();
        inner.session = Some(session.clone());
        self.publish(&inner);

        let launches = join_all(self.settings.cameras.iter().map(|camera| {
            let output = segment_path(&self.settings.recordings_dir, &session_id, camera.id, 0);
            self.launch(camera.id, camera.device.clone(), output)
        }))
        .await;

        let mut failures = Vec::new();
        for (camera, result) in self.settings.cameras.iter().zip(launches) {
            let Some(record) = session.per_camera.get_mut(&camera.id) else {
                continue;
            };
            match result {
                Ok(handle) => {
                    record.attach(handle);
                    record.started = true;
                }
                Err(failure) => {
                    record.last_error = Some(failure.reason.clone());
                    record.timed_out = failure.timed_out;
                    if failure.timed_out {
                        self.metrics.increment_engine_timeouts();
                    }
                    self.activity.record(
                        Event::CameraStartFailed,
                        format!("camera {}: {}", failure.camera_id, failure.reason),
                    );
                    failures.push(failure);
                }
            }
        }

        maybe_crash(points::RECORDING_AFTER_ENGINE_START);

        let started = session.started_cameras();
        if !failures.is_empty() && (self.settings.require_all_cameras || started.is_empty()) {
            let error = if failures.iter().any(|f| f.timed_out) {
                ErrorKind::EngineTimeout
            } else {
                ErrorKind::Engine
            };
            let failed: Vec<String> = failures.iter().map(|f| f.camera_id.to_string()).collect();
            let reason = format!("camera(s) {} failed to start", failed.join(", "));
            let mut report = self.abort_start(&mut inner, session, error, reason).await;
            report.failed_cameras = failures;
            report.preempted_preview = preempted_preview;
            report.superseded_session = superseded;
            return report;
        }

        let now = Utc::now();
        session.started_at = now;
        session.protected_until = now + chrono_span(self.settings.protection);
        session.touch(SessionState::Recording);

        if let Err(e) = self.persist(&session) {
            let reason = format!("cannot persist session '{}': {}", session_id, e);
            let mut report = self
                .abort_start(&mut inner, session, ErrorKind::Storage, reason)
                .await;
            report.preempted_preview = preempted_preview;
            report.superseded_session = superseded;
            return report;
        }

        self.metrics.increment_recordings_started();
        self.activity.record(
            Event::RecordingStarted,
            format!(
                "session '{}' recording on camera(s) {:?}{}",
                session_id,
                started,
                if failures.is_empty() {
                    String::new()
                } else {
                    format!(", {} camera(s) failed", failures.len())
                }
            ),
        );

        let report = StartReport {
            success: true,
            reason: if failures.is_empty() {
                "recording started".to_string()
            } else {
                "recording started on a subset of cameras".to_string()
            },
            error: None,
            session_id: Some(session_id),
            state: SessionState::Recording,
            idempotent: false,
            preempted_preview,
            superseded_session: superseded,
            started_cameras: started,
            failed_cameras: failures,
            protected_until: Some(session.protected_until),
            holder: Some(session.holder_id.clone()),
            force_would_succeed: None,
        };

        inner.session = Some(session);
        self.publish(&inner);
        report
    }

    /// Stop the active session.
    ///
    /// Inside the protection window a non-forced stop is rejected with
    /// `protected = true` and nothing changes.
    pub async fn stop(&self, force: bool) -> StopReport {
        let mut inner = self.inner.lock().await;
        self.drain_events(&mut inner);
        self.stop_locked(&mut inner, force).await
    }

    async fn stop_locked(&self, inner: &mut Inner, force: bool) -> StopReport {
        let Some(mut session) = inner.session.take() else {
            return StopReport::rejected(
                ErrorKind::Validation,
                "no active recording",
                SessionState::Idle,
            );
        };

        let now = Utc::now();
        if session.is_protected(now) && !force {
            let remaining = (session.protected_until - now).num_milliseconds();
            let mut report = StopReport::rejected(
                ErrorKind::ResourceConflict,
                format!(
                    "session '{}' is protected for another {} ms; force would stop it",
                    session.session_id, remaining
                ),
                session.state,
            );
            report.protected = true;
            report.protected_until = Some(session.protected_until);
            report.session_id = Some(session.session_id.clone());
            report.holder = Some(session.holder_id.clone());
            report.force_would_succeed = Some(true);
            self.activity
                .record(Event::RecordingStopProtected, report.reason.clone());
            inner.session = Some(session);
            return report;
        }

        session.touch(SessionState::Stopping);
        if let Err(e) = self.persist(&session) {
            warn!(session_id = %session.session_id, error = %e, "failed to persist stopping state");
        }
        inner.session = Some(session.clone());
        self.publish(inner);
        self.activity.record(
            Event::RecordingStopping,
            format!(
                "session '{}' stopping{}",
                session.session_id,
                if force { " (forced)" } else { "" }
            ),
        );

        let handles: Vec<(CameraId, PipelineHandle)> = session
            .per_camera
            .values()
            .filter(|c| c.started)
            .filter_map(|c| c.pipeline_ref.map(|h| (c.camera_id, h)))
            .collect();

        let outcomes = join_all(
            handles
                .iter()
                .map(|(_, handle)| self.stop_pipeline(*handle, true, self.settings.stop_timeout)),
        )
        .await;

        let mut stop_failed = Vec::new();
        for ((camera_id, handle), (outcome, error)) in handles.iter().zip(outcomes) {
            self.engine.release(*handle);
            if let Some(record) = session.per_camera.get_mut(camera_id) {
                record.apply_stop(outcome);
                if error.is_some() {
                    record.last_error = error;
                    stop_failed.push(*camera_id);
                }
            }
            if outcome.timed_out {
                self.metrics.increment_engine_timeouts();
                self.activity.record(
                    Event::EngineTimeout,
                    format!("camera {} did not confirm end-of-stream in time", camera_id),
                );
            }
        }

        maybe_crash(points::RECORDING_AFTER_ENGINE_STOP);

        // Hardware access is never conditioned on content correctness.
        let lock_released = self.release_lock(&session.holder_id).await;

        let targets: Vec<(CameraId, PathBuf)> = session
            .per_camera
            .values()
            .filter(|c| c.started)
            .flat_map(|c| c.segments.iter().map(move |s| (c.camera_id, s.clone())))
            .collect();
        let probes = join_all(targets.iter().map(|(_, path)| self.probe_segment(path))).await;

        let mut cameras = Vec::new();
        for record in session.per_camera.values_mut() {
            let reports: Vec<ProbeReport> = targets
                .iter()
                .zip(probes.iter())
                .filter(|((id, _), _)| *id == record.camera_id)
                .map(|(_, report)| report.clone())
                .collect();

            if record.started {
                let ok = !reports.is_empty() && reports.iter().all(|r| r.ok);
                record.integrity_ok = Some(ok);
                if !ok {
                    self.metrics.increment_integrity_failures();
                    let reasons: Vec<String> = reports
                        .iter()
                        .filter_map(|r| {
                            r.reason
                                .as_ref()
                                .map(|reason| format!("{}: {}", r.path.display(), reason))
                        })
                        .collect();
                    self.activity.record(
                        Event::IntegrityFailure,
                        format!("camera {}: {}", record.camera_id, reasons.join("; ")),
                    );
                }
            }

            cameras.push(CameraStopReport {
                camera_id: record.camera_id,
                eos_received: record.eos_received,
                finalized: record.finalized,
                timed_out: record.timed_out,
                integrity_ok: record.integrity_ok,
                probes: reports,
                last_error: record.last_error.clone(),
            });
        }

        let started: Vec<&CameraRecord> = session.per_camera.values().filter(|c| c.started).collect();
        let transport_success = !started.is_empty()
            && started.iter().all(|c| {
                c.pipeline_ref.is_some()
                    && c.eos_received
                    && !c.timed_out
                    && !stop_failed.contains(&c.camera_id)
            });
        let integrity_ok =
            !started.is_empty() && started.iter().all(|c| c.integrity_ok == Some(true));
        let any_timed_out = started.iter().any(|c| c.timed_out);

        let (state, error, reason) = if integrity_ok {
            let reason = if transport_success {
                "stopped cleanly".to_string()
            } else {
                "stopped; output valid but end-of-stream not confirmed".to_string()
            };
            (SessionState::Stopped, None, reason)
        } else if any_timed_out {
            (
                SessionState::Failed,
                Some(ErrorKind::EngineTimeout),
                "engine did not confirm stop within its bound".to_string(),
            )
        } else if transport_success {
            (
                SessionState::Failed,
                Some(ErrorKind::IntegrityFailure),
                "pipelines stopped but output failed integrity probe".to_string(),
            )
        } else {
            (
                SessionState::Failed,
                Some(ErrorKind::Engine),
                "engine failed to stop pipelines cleanly".to_string(),
            )
        };

        session.touch(state);
        if let Err(e) = self.persist(&session) {
            warn!(session_id = %session.session_id, error = %e, "failed to persist final state");
        }

        if state == SessionState::Stopped {
            self.metrics.increment_recordings_stopped();
            self.activity.record(
                Event::RecordingStopped,
                format!(
                    "session '{}' stopped (transport_success={}, integrity_ok={})",
                    session.session_id, transport_success, integrity_ok
                ),
            );
        } else {
            self.metrics.increment_recordings_failed();
            self.activity.record(
                Event::RecordingFailed,
                format!("session '{}' failed: {}", session.session_id, reason),
            );
        }

        let report = StopReport {
            success: state == SessionState::Stopped,
            reason,
            error,
            session_id: Some(session.session_id.clone()),
            state,
            protected: false,
            protected_until: None,
            holder: None,
            force_would_succeed: None,
            transport_success,
            integrity_ok,
            lock_released,
            cameras,
            stopped_at: Some(Utc::now()),
        };

        inner.session = None;
        inner.growth.clear();
        inner.last_report = Some(report.clone());
        self.publish(inner);
        report
    }

    /// Reconcile the persisted session with the engine after a restart.
    ///
    /// Pipelines confirmed running: re-acquire the lock for the same holder
    /// and resume without re-issuing start. Anything else: hard-stop
    /// survivors, mark the session failed, release the lock.
    pub async fn recover_on_restart(&self) -> RecoveryReport {
        let mut inner = self.inner.lock().await;

        let session = match self.record.read() {
            Ok(Some(session)) => session,
            Ok(None) => {
                let reason = if self.release_orphaned_hold().await {
                    "no persisted session; orphaned recording hold released"
                } else {
                    "no persisted session"
                };
                return RecoveryReport {
                    outcome: RecoveryOutcome::NothingToRecover,
                    session_id: None,
                    reason: reason.to_string(),
                    error: None,
                };
            }
            Err(e) if e.is_corrupt() => {
                let released = self.release_lock(&self.settings.holder_id).await;
                if let Err(remove_err) = self.record.remove() {
                    warn!(error = %remove_err, "failed to remove corrupt session record");
                }
                self.metrics.increment_recordings_failed();
                let reason = format!(
                    "session record unreadable ({}); lock {}",
                    e,
                    if released { "released" } else { "not released" }
                );
                self.activity.record(Event::RecoveryMismatch, reason.clone());
                return RecoveryReport {
                    outcome: RecoveryOutcome::MarkedFailed,
                    session_id: None,
                    reason,
                    error: Some(ErrorKind::CrashRecoveryMismatch),
                };
            }
            Err(e) => {
                return RecoveryReport {
                    outcome: RecoveryOutcome::NothingToRecover,
                    session_id: None,
                    reason: format!("cannot read session record: {}", e),
                    error: Some(ErrorKind::Storage),
                }
            }
        };

        if !session.state.is_active() {
            let mut reason = format!("last session '{}' ended {}", session.session_id, session.state);
            if self.release_orphaned_hold().await {
                reason.push_str("; orphaned recording hold released");
            }
            return RecoveryReport {
                outcome: RecoveryOutcome::NothingToRecover,
                session_id: Some(session.session_id.clone()),
                reason,
                error: None,
            };
        }

        self.activity.record(
            Event::RecoveryBegin,
            format!(
                "persisted session '{}' was {} at shutdown",
                session.session_id, session.state
            ),
        );

        let mut problems = Vec::new();
        let mut running = Vec::new();

        if session.state == SessionState::Stopping {
            problems.push("stop was interrupted; its outcome cannot be known".to_string());
        } else {
            for record in session.per_camera.values() {
                if !record.started {
                    if session.require_all_cameras {
                        problems.push(format!("camera {} never started", record.camera_id));
                    }
                    continue;
                }
                let Some(handle) = record.pipeline_ref else {
                    problems.push(format!("camera {} has no pipeline", record.camera_id));
                    continue;
                };
                let state = timeout(self.settings.start_timeout, self.engine.query_state(handle))
                    .await
                    .unwrap_or(PipelineState::Unknown);
                if state == PipelineState::Running {
                    running.push(handle);
                } else {
                    problems.push(format!(
                        "camera {} pipeline {} is {}",
                        record.camera_id, handle, state
                    ));
                }
            }
            if running.is_empty() && problems.is_empty() {
                problems.push("no pipeline is running".to_string());
            }
        }

        if problems.is_empty() {
            match self
                .lock
                .acquire_async(Mode::Recording, &session.holder_id, false)
                .await
            {
                Ok(grant) if grant.is_granted() => {
                    if grant.previous_mode() == Some(Mode::Preview) {
                        self.preview.preempt().await;
                    }
                    return self.resume(&mut inner, session, running);
                }
                Ok(grant) => problems.push(format!(
                    "cannot re-acquire recording lock: {}",
                    grant.denial().map(|d| d.reason.as_str()).unwrap_or("denied")
                )),
                Err(e) => problems.push(format!("cannot re-acquire recording lock: {}", e)),
            }
        }

        self.fail_recovered(&mut inner, session, problems.join("; "))
            .await
    }

    fn resume(
        &self,
        inner: &mut Inner,
        mut session: RecordingSession,
        running: Vec<PipelineHandle>,
    ) -> RecoveryReport {
        for handle in &running {
            self.watch_pipeline(*handle);
        }
        if session.state == SessionState::Starting {
            let now = Utc::now();
            session.started_at = now;
            session.protected_until = now + chrono_span(self.settings.protection);
        }
        session.touch(SessionState::Recording);
        if let Err(e) = self.persist(&session) {
            warn!(session_id = %session.session_id, error = %e, "failed to persist resumed session");
        }

        let reason = format!(
            "session '{}' resumed with {} running pipeline(s)",
            session.session_id,
            running.len()
        );
        self.activity.record(Event::RecoveryResumed, reason.clone());

        let session_id = session.session_id.clone();
        inner.epoch += 1;
        inner.growth.clear();
        inner.session = Some(session);
        self.publish(inner);

        RecoveryReport {
            outcome: RecoveryOutcome::Resumed,
            session_id: Some(session_id),
            reason,
            error: None,
        }
    }

    async fn fail_recovered(
        &self,
        inner: &mut Inner,
        mut session: RecordingSession,
        reason: String,
    ) -> RecoveryReport {
        let mut cameras = Vec::new();
        for record in session.per_camera.values_mut() {
            if let Some(handle) = record.pipeline_ref {
                let state = timeout(self.settings.start_timeout, self.engine.query_state(handle))
                    .await
                    .unwrap_or(PipelineState::Unknown);
                if state == PipelineState::Running {
                    let (outcome, _) = self
                        .stop_pipeline(handle, false, self.settings.stop_timeout)
                        .await;
                    record.apply_stop(outcome);
                }
                self.engine.release(handle);
            }
            cameras.push(CameraStopReport {
                camera_id: record.camera_id,
                eos_received: record.eos_received,
                finalized: record.finalized,
                timed_out: record.timed_out,
                integrity_ok: None,
                probes: Vec::new(),
                last_error: record.last_error.clone(),
            });
        }

        session.touch(SessionState::Failed);
        if let Err(e) = self.persist(&session) {
            warn!(session_id = %session.session_id, error = %e, "failed to persist recovered failure");
        }
        let lock_released = self.release_lock(&session.holder_id).await;

        self.metrics.increment_recordings_failed();
        let reason = format!("session '{}' marked failed: {}", session.session_id, reason);
        self.activity.record(Event::RecoveryMismatch, reason.clone());

        inner.last_report = Some(StopReport {
            success: false,
            reason: reason.clone(),
            error: Some(ErrorKind::CrashRecoveryMismatch),
            session_id: Some(session.session_id.clone()),
            state: SessionState::Failed,
            protected: false,
            protected_until: None,
            holder: None,
            force_would_succeed: None,
            transport_success: false,
            integrity_ok: false,
            lock_released,
            cameras,
            stopped_at: Some(Utc::now()),
        });
        inner.session = None;
        self.publish(inner);

        RecoveryReport {
            outcome: RecoveryOutcome::MarkedFailed,
            session_id: Some(session.session_id),
            reason,
            error: Some(ErrorKind::CrashRecoveryMismatch),
        }
    }

    /// Release a recording hold that no active session backs.
    ///
    /// Left behind when the process died between acquiring the token and
    /// persisting the session, or between persisting a terminal state and
    /// releasing.
    async fn release_orphaned_hold(&self) -> bool {
        match self.lock.holds(Mode::Recording, &self.settings.holder_id) {
            Ok(true) => self.release_lock(&self.settings.holder_id).await,
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "cannot read token while checking for an orphaned hold");
                false
            }
        }
    }

    async fn abort_start(
        &self,
        inner: &mut Inner,
        mut session: RecordingSession,
        error: ErrorKind,
        reason: String,
    ) -> StartReport {
        let started: Vec<(CameraId, PipelineHandle)> = session
            .per_camera
            .values()
            .filter(|c| c.started)
            .filter_map(|c| c.pipeline_ref.map(|h| (c.camera_id, h)))
            .collect();
        let outcomes = join_all(
            started
                .iter()
                .map(|(_, handle)| self.stop_pipeline(*handle, false, self.settings.stop_timeout)),
        )
        .await;
        for ((camera_id, handle), (outcome, _)) in started.iter().zip(outcomes) {
            self.engine.release(*handle);
            if let Some(record) = session.per_camera.get_mut(camera_id) {
                record.apply_stop(outcome);
            }
        }

        session.touch(SessionState::Failed);
        if let Err(e) = self.persist(&session) {
            warn!(session_id = %session.session_id, error = %e, "failed to persist aborted start");
        }
        self.release_lock(&session.holder_id).await;

        self.metrics.increment_recordings_failed();
        self.activity.record(
            Event::RecordingStartFailed,
            format!("session '{}': {}", session.session_id, reason),
        );

        inner.session = None;
        self.publish(inner);

        let mut report = StartReport::rejected(error, reason, SessionState::Failed);
        report.session_id = Some(session.session_id);
        report
    }

    /// Create and start one camera's recording pipeline
    pub(super) async fn launch(
        &self,
        camera_id: CameraId,
        device: String,
        output: PathBuf,
    ) -> Result<PipelineHandle, CameraFailure> {
        let bound = self.settings.start_timeout;
        let spec = PipelineSpec::recording(device, output);

        let handle = match timeout(bound, self.engine.create(camera_id, &spec)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(CameraFailure {
                    camera_id,
                    reason: e.to_string(),
                    timed_out: false,
                })
            }
            Err(_) => {
                return Err(CameraFailure {
                    camera_id,
                    reason: format!("engine did not create pipeline within {:?}", bound),
                    timed_out: true,
                })
            }
        };
        self.watch_pipeline(handle);

        match timeout(bound, self.engine.start(handle)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                self.engine.release(handle);
                Err(CameraFailure {
                    camera_id,
                    reason: e.to_string(),
                    timed_out: false,
                })
            }
            Err(_) => {
                self.stop_pipeline(handle, false, self.settings.stop_timeout)
                    .await;
                self.engine.release(handle);
                Err(CameraFailure {
                    camera_id,
                    reason: format!("engine did not confirm start within {:?}", bound),
                    timed_out: true,
                })
            }
        }
    }

    /// Bounded engine stop; never returns without an explicit outcome
    pub(super) async fn stop_pipeline(
        &self,
        handle: PipelineHandle,
        graceful: bool,
        bound: Duration,
    ) -> (StopOutcome, Option<String>) {
        match timeout(bound + STOP_GRACE, self.engine.stop(handle, graceful, bound)).await {
            Ok(Ok(outcome)) => (outcome, None),
            Ok(Err(e)) => (StopOutcome::default(), Some(e.to_string())),
            Err(_) => (
                StopOutcome::timed_out(),
                Some(format!("engine did not return from stop of {}", handle)),
            ),
        }
    }

    async fn probe_segment(&self, path: &Path) -> ProbeReport {
        match timeout(self.settings.probe_timeout, self.probe.probe(path)).await {
            Ok(report) => report,
            Err(_) => ProbeReport::fail(path, 0, "integrity probe timed out"),
        }
    }

    /// Route engine notifications for `handle` into the controller
    fn watch_pipeline(&self, handle: PipelineHandle) {
        let tx = self.events_tx.clone();
        let notify = Arc::clone(&self.events_notify);
        let callback: EventCallback = Arc::new(move |event| {
            let _ = tx.send(event);
            notify.notify_one();
        });
        self.engine.on_eos(handle, Arc::clone(&callback));
        self.engine.on_error(handle, callback);
    }

    /// Apply queued engine events to the session
    pub(super) fn drain_events(&self, inner: &mut Inner) {
        let mut changed = false;
        while let Ok(event) = inner.events_rx.try_recv() {
            let Some(session) = inner.session.as_mut() else {
                continue;
            };
            let Some(record) = session.camera_for_handle(event.handle()) else {
                continue;
            };
            match &event {
                EngineEvent::Eos { camera_id, handle } => {
                    if !record.eos_received {
                        record.eos_received = true;
                        changed = true;
                        self.activity.record(
                            Event::EngineEos,
                            format!("camera {} pipeline {} reached end-of-stream", camera_id, handle),
                        );
                    }
                }
                EngineEvent::Error {
                    camera_id,
                    handle,
                    message,
                } => {
                    record.last_error = Some(message.clone());
                    changed = true;
                    self.activity.record(
                        Event::EngineError,
                        format!("camera {} pipeline {}: {}", camera_id, handle, message),
                    );
                }
            }
        }

        if changed {
            if let Some(session) = &inner.session {
                if let Err(e) = self.persist(session) {
                    warn!(session_id = %session.session_id, error = %e, "failed to persist engine event");
                }
            }
            self.publish(inner);
        }
    }

    /// Apply any queued engine events now
    pub async fn pump_events(&self) {
        let mut inner = self.inner.lock().await;
        self.drain_events(&mut inner);
    }

    /// Background task applying engine events as they arrive
    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                controller.events_notify.notified().await;
                controller.pump_events().await;
            }
        })
    }

    pub(super) fn persist(&self, session: &RecordingSession) -> StoreResult<()> {
        self.record.write_atomic(session)
    }

    async fn release_lock(&self, holder_id: &str) -> bool {
        match self.lock.release_async(Mode::Recording, holder_id).await {
            Ok(ReleaseOutcome::Released) | Ok(ReleaseOutcome::AlreadyIdle) => true,
            Ok(ReleaseOutcome::NotHolder { .. }) => false,
            Err(e) => {
                warn!(holder_id, error = %e, "failed to release recording lock");
                false
            }
        }
    }

    pub(super) fn device(&self, camera_id: CameraId) -> Option<String> {
        self.settings
            .cameras
            .iter()
            .find(|c| c.id == camera_id)
            .map(|c| c.device.clone())
    }

    pub(super) fn publish(&self, inner: &Inner) {
        let status = match &inner.session {
            Some(session) => RecordingStatus {
                session_epoch: inner.epoch,
                state: session.state,
                session_id: Some(session.session_id.clone()),
                started_at: Some(session.started_at),
                protected_until: Some(session.protected_until),
                cameras: session.per_camera.values().cloned().collect(),
                last_report: inner.last_report.clone(),
            },
            None => RecordingStatus {
                session_epoch: inner.epoch,
                last_report: inner.last_report.clone(),
                ..RecordingStatus::idle()
            },
        };
        self.status_tx.send_replace(status);
    }

    fn current_state(inner: &Inner) -> SessionState {
        inner
            .session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Latest published status
    pub fn status(&self) -> RecordingStatus {
        self.status_tx.borrow().clone()
    }

    /// Status updates; the receiver always sees the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<RecordingStatus> {
        self.status_tx.subscribe()
    }

    /// Result of the most recent health check
    pub async fn last_health(&self) -> Option<HealthReport> {
        self.inner.lock().await.last_health.clone()
    }

    /// Persisted session record, as a restarted coordinator would see it
    pub fn persisted_session(&self) -> StoreResult<Option<RecordingSession>> {
        self.record.read()
    }
}

impl std::fmt::Debug for RecordingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingController")
            .field("engine", &self.engine.name())
            .field("holder_id", &self.settings.holder_id)
            .finish()
    }
}
