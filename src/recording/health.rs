//! Recording health checks
//!
//! A camera is unhealthy when its pipeline is no longer running or its
//! current segment has not grown for longer than the stall interval. An
//! unhealthy camera's pipeline is restarted onto a fresh segment a bounded
//! number of times, after which the camera is marked degraded and left
//! alone.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;

use super::controller::RecordingController;
use super::session::{segment_path, CameraRecord, SessionState};
use crate::engine::{CameraId, PipelineState};
use crate::lock::Mode;
use crate::observability::Event;

/// Last observed growth of one camera's segment
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrowthTracker {
    bytes: u64,
    last_growth: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraHealth {
    pub camera_id: CameraId,
    pub pipeline_state: PipelineState,
    pub bytes: Option<u64>,
    pub stalled: bool,
    pub degraded: bool,
    pub recovery_attempts: u32,
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub state: SessionState,
    pub healthy: bool,
    pub cameras: Vec<CameraHealth>,
}

impl HealthReport {
    fn idle(state: SessionState, session_id: Option<String>) -> Self {
        Self {
            checked_at: Utc::now(),
            session_id,
            state,
            healthy: true,
            cameras: Vec::new(),
        }
    }
}

impl RecordingController {
    /// Check every recording camera once and act on stalls.
    pub async fn health_check(&self) -> HealthReport {
        let mut inner = self.inner.lock().await;
        self.drain_events(&mut inner);

        let Some(mut session) = inner.session.take() else {
            let report = HealthReport::idle(SessionState::Idle, None);
            inner.last_health = Some(report.clone());
            return report;
        };
        if session.state != SessionState::Recording {
            let report = HealthReport::idle(session.state, Some(session.session_id.clone()));
            inner.session = Some(session);
            inner.last_health = Some(report.clone());
            return report;
        }

        let session_id = session.session_id.clone();
        let bound = self.settings.start_timeout;
        let now = Instant::now();
        let mut cameras = Vec::new();
        let mut changed = false;

        for record in session.per_camera.values_mut() {
            let camera_id = record.camera_id;
            if !record.started || record.degraded {
                cameras.push(CameraHealth {
                    camera_id,
                    pipeline_state: PipelineState::Unknown,
                    bytes: None,
                    stalled: false,
                    degraded: record.degraded,
                    recovery_attempts: record.recovery_attempts,
                    action: None,
                });
                continue;
            };

            // No pipeline at all after a failed restart counts as not running
            let (state, bytes) = match record.pipeline_ref {
                Some(handle) => {
                    let state = timeout(bound, self.engine.query_state(handle))
                        .await
                        .unwrap_or(PipelineState::Unknown);
                    let stats = timeout(bound, self.engine.segment_stats(handle))
                        .await
                        .ok()
                        .flatten();
                    (state, stats.map(|s| s.bytes))
                }
                None => (PipelineState::Unknown, None),
            };

            let tracker = inner.growth.entry(camera_id).or_insert(GrowthTracker {
                bytes: bytes.unwrap_or(0),
                last_growth: now,
            });
            if let Some(b) = bytes {
                if b > tracker.bytes {
                    tracker.bytes = b;
                    tracker.last_growth = now;
                }
            }
            let idle_for = now.duration_since(tracker.last_growth);
            let stalled =
                state != PipelineState::Running || idle_for > self.settings.stall_interval;

            let mut action = None;
            if stalled {
                self.activity.record(
                    Event::HealthStall,
                    format!(
                        "camera {} unhealthy: pipeline {}, no growth for {:?}",
                        camera_id, state, idle_for
                    ),
                );
                changed = true;
                if record.recovery_attempts < self.settings.max_recovery_attempts {
                    action = Some(self.restart_camera(&session_id, record).await);
                    inner.growth.remove(&camera_id);
                } else {
                    record.degraded = true;
                    self.activity.record(
                        Event::CameraDegraded,
                        format!(
                            "camera {} degraded after {} recovery attempt(s)",
                            camera_id, record.recovery_attempts
                        ),
                    );
                    action = Some("marked degraded".to_string());
                }
            }

            cameras.push(CameraHealth {
                camera_id,
                pipeline_state: state,
                bytes,
                stalled,
                degraded: record.degraded,
                recovery_attempts: record.recovery_attempts,
                action,
            });
        }

        let report = HealthReport {
            checked_at: Utc::now(),
            session_id: Some(session_id),
            state: session.state,
            healthy: cameras.iter().all(|c| !c.stalled && !c.degraded),
            cameras,
        };

        if changed {
            if let Err(e) = self.persist(&session) {
                tracing::warn!(session_id = %session.session_id, error = %e, "failed to persist health update");
            }
        }
        inner.session = Some(session);
        inner.last_health = Some(report.clone());
        if changed {
            self.publish(&inner);
        }
        report
    }

    /// Replace a camera's pipeline with a new one writing the next segment.
    ///
    /// The engine is only started while the recording token is confirmed
    /// held.
    async fn restart_camera(&self, session_id: &str, record: &mut CameraRecord) -> String {
        record.recovery_attempts += 1;
        self.metrics.increment_health_recoveries();
        self.activity.record(
            Event::HealthRecoveryAttempt,
            format!(
                "camera {} recovery attempt {}/{}",
                record.camera_id, record.recovery_attempts, self.settings.max_recovery_attempts
            ),
        );

        match self.lock.holds(Mode::Recording, &self.settings.holder_id) {
            Ok(true) => {}
            Ok(false) => {
                record.last_error = Some("recording token no longer held".to_string());
                return "skipped: recording token not held".to_string();
            }
            Err(e) => {
                record.last_error = Some(format!("cannot read recording token: {}", e));
                return "skipped: recording token unreadable".to_string();
            }
        }

        if let Some(old) = record.pipeline_ref.take() {
            let (outcome, _) = self
                .stop_pipeline(old, true, self.settings.stop_timeout)
                .await;
            record.apply_stop(outcome);
            self.engine.release(old);
        }

        let Some(device) = self.device(record.camera_id) else {
            record.last_error = Some("camera no longer configured".to_string());
            return "skipped: camera not configured".to_string();
        };
        let output = segment_path(
            &self.settings.recordings_dir,
            session_id,
            record.camera_id,
            record.segments.len(),
        );

        match self.launch(record.camera_id, device, output.clone()).await {
            Ok(handle) => {
                record.attach(handle);
                record.segments.push(output);
                record.last_error = None;
                format!("restarted as {} on segment {}", handle, record.segments.len() - 1)
            }
            Err(failure) => {
                record.last_error = Some(failure.reason.clone());
                format!("restart failed: {}", failure.reason)
            }
        }
    }
}
