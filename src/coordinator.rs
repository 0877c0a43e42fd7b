//! Coordinator wiring
//!
//! Builds every subsystem from one `CoordinatorConfig`, runs the boot
//! sequence and owns the periodic maintenance tasks.
//!
//! Boot order:
//! 1. recover a persisted recording session against the live engine
//! 2. release a preview hold left by this node (preview never survives a
//!    restart)
//! 3. reclaim a stale token left by a dead holder

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::command_plane::{
    BroadcastIntervals, Broadcaster, CommandExecutor, CommandPlane, CommandPlaneSettings,
    IdempotencyCache,
};
use crate::config::{ConfigError, CoordinatorConfig, EngineKind};
use crate::engine::{
    Mp4StructureProbe, PipelineEngine, ProcessEngine, SimulatedEngine, DEFAULT_MAX_BOXES,
};
use crate::http_server::HttpServer;
use crate::lock::{ExclusivityToken, LockManager, Mode, ProcessLiveness, ReleaseOutcome};
use crate::observability::{ActivityLog, Event, MetricsRegistry};
use crate::preview::{PreviewController, PreviewSettings};
use crate::recording::{RecordingController, RecordingSettings, RecoveryReport};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to prepare directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// What the boot sequence found and did
#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub recovery: RecoveryReport,
    pub preview_hold_released: bool,
    pub reclaimed: Option<ExclusivityToken>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    lock: Arc<LockManager>,
    engine: Arc<dyn PipelineEngine>,
    recording: Arc<RecordingController>,
    preview: Arc<PreviewController>,
    plane: Arc<CommandPlane>,
    activity: Arc<ActivityLog>,
    metrics: Arc<MetricsRegistry>,
}

impl Coordinator {
    /// Build with the engine named in the config.
    pub fn build(config: CoordinatorConfig) -> CoordinatorResult<Self> {
        let engine: Arc<dyn PipelineEngine> = match config.engine.kind {
            EngineKind::Simulated => Arc::new(SimulatedEngine::new()),
            EngineKind::Process => Arc::new(ProcessEngine::new(config.engine.process_config())),
        };
        Self::with_engine(config, engine)
    }

    /// Build around a caller-supplied engine.
    pub fn with_engine(
        config: CoordinatorConfig,
        engine: Arc<dyn PipelineEngine>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        for dir in [&config.state_dir, &config.recordings_dir] {
            fs::create_dir_all(dir).map_err(|source| CoordinatorError::Directory {
                path: dir.clone(),
                source,
            })?;
        }

        let activity = Arc::new(ActivityLog::new(config.activity_capacity));
        let metrics = Arc::new(MetricsRegistry::new());

        let lock = Arc::new(LockManager::open(
            &config.state_dir,
            config.lock.manager_config(),
            Arc::new(ProcessLiveness),
            Arc::clone(&activity),
            Arc::clone(&metrics),
        ));

        let preview = Arc::new(PreviewController::new(
            PreviewSettings::from_config(&config),
            Arc::clone(&lock),
            Arc::clone(&engine),
            Arc::clone(&activity),
            Arc::clone(&metrics),
        ));

        let recording = Arc::new(RecordingController::new(
            RecordingSettings::from_config(&config),
            Arc::clone(&lock),
            Arc::clone(&engine),
            Arc::new(Mp4StructureProbe::new(DEFAULT_MAX_BOXES)),
            Arc::clone(&preview),
            Arc::clone(&activity),
            Arc::clone(&metrics),
        ));

        let cache = IdempotencyCache::new(
            config.command_plane.idempotency_capacity,
            Duration::from_secs(config.command_plane.idempotency_ttl_secs),
        );
        let executor = Arc::new(CommandExecutor::new(
            config.node_id.clone(),
            Arc::clone(&recording),
            Arc::clone(&preview),
            Arc::clone(&lock),
            cache,
            Arc::clone(&activity),
            Arc::clone(&metrics),
        ));
        let plane = Arc::new(CommandPlane::new(
            CommandPlaneSettings::from_config(&config.command_plane),
            executor,
            Arc::new(Broadcaster::new()),
        ));

        Ok(Self {
            config,
            lock,
            engine,
            recording,
            preview,
            plane,
            activity,
            metrics,
        })
    }

    /// Reconcile persisted state with the live engine.
    pub async fn boot(&self) -> BootReport {
        self.activity.record(
            Event::BootStart,
            format!("node {} booting", self.config.node_id),
        );

        let recovery = self.recording.recover_on_restart().await;

        let preview_holder = PreviewSettings::from_config(&self.config).holder_id;
        let preview_hold_released = match self
            .lock
            .release_async(Mode::Preview, &preview_holder)
            .await
        {
            Ok(ReleaseOutcome::Released) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "could not release leftover preview hold");
                false
            }
        };

        let reclaimed = match self.lock.reclaim_stale_async().await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                tracing::warn!(error = %e, "stale token reclaim failed");
                None
            }
        };

        self.activity.record(
            Event::BootComplete,
            format!("recovery: {:?}", recovery.outcome),
        );
        BootReport {
            recovery,
            preview_hold_released,
            reclaimed,
        }
    }

    /// Event pump, stale-token reclaim, health checks and broadcasts.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.recording.spawn_event_pump()];

        let lock = Arc::clone(&self.lock);
        let reclaim_every = self.config.lock.reclaim_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reclaim_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = lock.reclaim_stale_async().await {
                    tracing::warn!(error = %e, "stale token reclaim failed");
                }
            }
        }));

        let recording = Arc::clone(&self.recording);
        let health_every = Duration::from_secs(self.config.health.interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = recording.health_check().await;
                if !report.healthy {
                    tracing::warn!(session_id = ?report.session_id, "recording health check found problems");
                }
            }
        }));

        tasks.extend(self.plane.broadcaster().spawn(
            Arc::clone(self.plane.executor()),
            BroadcastIntervals::from_config(&self.config.command_plane),
        ));
        tasks
    }

    pub fn http_server(&self) -> HttpServer {
        HttpServer::with_config(self.config.http.clone(), Arc::clone(&self.plane))
    }

    /// Boot, start maintenance and serve until ctrl-c.
    pub async fn run(self) -> CoordinatorResult<BootReport> {
        let report = self.boot().await;
        let tasks = self.spawn_maintenance();
        self.activity.record(
            Event::Serving,
            format!("listening on {}", self.config.http.socket_addr()),
        );

        let result = self.http_server().start().await;
        for task in tasks {
            task.abort();
        }
        result.map_err(CoordinatorError::Serve)?;
        Ok(report)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn lock(&self) -> &Arc<LockManager> {
        &self.lock
    }

    pub fn engine(&self) -> &Arc<dyn PipelineEngine> {
        &self.engine
    }

    pub fn recording(&self) -> &Arc<RecordingController> {
        &self.recording
    }

    pub fn preview(&self) -> &Arc<PreviewController> {
        &self.preview
    }

    pub fn plane(&self) -> &Arc<CommandPlane> {
        &self.plane
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        self.plane.executor()
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecoveryOutcome;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_boot_on_empty_state() {
        let dir = TempDir::new().unwrap();
        let coordinator = Coordinator::build(CoordinatorConfig::rooted_at(dir.path())).unwrap();
        let report = coordinator.boot().await;

        assert_eq!(report.recovery.outcome, RecoveryOutcome::NothingToRecover);
        assert!(!report.preview_hold_released);
        assert!(report.reclaimed.is_none());
        assert!(dir.path().join("state").is_dir());
        assert!(dir.path().join("recordings").is_dir());
    }

    #[tokio::test]
    async fn test_boot_releases_own_preview_hold() {
        let dir = TempDir::new().unwrap();
        let config = CoordinatorConfig::rooted_at(dir.path());
        {
            let first = Coordinator::build(config.clone()).unwrap();
            let report = first.preview().start(Some(0)).await;
            assert!(report.success);
        }

        let second = Coordinator::build(config).unwrap();
        let report = second.boot().await;
        assert!(report.preview_hold_released);
        assert_eq!(second.lock().query().unwrap().mode, Mode::Idle);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = CoordinatorConfig::rooted_at(dir.path());
        config.cameras.clear();
        assert!(matches!(
            Coordinator::build(config),
            Err(CoordinatorError::Config(_))
        ));
    }
}
