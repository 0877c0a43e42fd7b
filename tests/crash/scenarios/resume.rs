//! Restart scenarios where the engine outlives the coordinator
//!
//! The coordinator is dropped without stopping; a new one over the same
//! data dir and the same engine must adopt the running pipelines instead
//! of starting them again.

use crate::crash::utils::{create_temp_data_dir, open_with_engine, CRASH_SESSION_ID};
use dualcam::engine::{PipelineKind, SimulatedEngine};
use dualcam::errors::ErrorKind;
use dualcam::lock::Mode;
use dualcam::recording::{RecoveryOutcome, SessionState};

/// Pipelines still running: resume under the same holder, no new start.
#[tokio::test]
async fn test_restart_resumes_running_session() {
    let temp_dir = create_temp_data_dir();
    let engine = SimulatedEngine::new();
    {
        let coordinator = open_with_engine(temp_dir.path(), &engine);
        let report = coordinator
            .recording()
            .start(Some(CRASH_SESSION_ID.to_string()), false)
            .await;
        assert!(report.success, "{}", report.reason);
    }
    let calls = engine.start_calls();

    let coordinator = open_with_engine(temp_dir.path(), &engine);
    let boot = coordinator.boot().await;

    assert_eq!(boot.recovery.outcome, RecoveryOutcome::Resumed);
    assert_eq!(boot.recovery.session_id.as_deref(), Some(CRASH_SESSION_ID));
    assert_eq!(engine.start_calls(), calls);

    let status = coordinator.recording().status();
    assert_eq!(status.state, SessionState::Recording);
    assert!(status.session_epoch >= 1);
    assert!(coordinator
        .lock()
        .holds(Mode::Recording, "dualcam:recording")
        .unwrap());

    // The resumed session stops like any other.
    let stopped = coordinator.recording().stop(false).await;
    assert!(stopped.success, "{}", stopped.reason);
    assert!(engine.running(PipelineKind::Recording).is_empty());
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
}

/// Engine lost its pipelines: the session is failed and the lock freed.
#[tokio::test]
async fn test_restart_with_lost_pipelines_marks_failed() {
    let temp_dir = create_temp_data_dir();
    let engine = SimulatedEngine::new();
    {
        let coordinator = open_with_engine(temp_dir.path(), &engine);
        coordinator
            .recording()
            .start(Some(CRASH_SESSION_ID.to_string()), false)
            .await;
    }
    engine.forget_pipelines();

    let coordinator = open_with_engine(temp_dir.path(), &engine);
    let boot = coordinator.boot().await;

    assert_eq!(boot.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert_eq!(boot.recovery.error, Some(ErrorKind::CrashRecoveryMismatch));
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
    assert_eq!(coordinator.recording().status().state, SessionState::Idle);
}

/// One pipeline died while the coordinator was down: the survivor is
/// hard-stopped and the session failed.
#[tokio::test]
async fn test_restart_with_partial_pipelines_stops_survivors() {
    let temp_dir = create_temp_data_dir();
    let engine = SimulatedEngine::new();
    {
        let coordinator = open_with_engine(temp_dir.path(), &engine);
        coordinator
            .recording()
            .start(Some(CRASH_SESSION_ID.to_string()), false)
            .await;
    }
    let (_, handle) = engine.running(PipelineKind::Recording)[1];
    engine.inject_error(handle, "usb reset");

    let coordinator = open_with_engine(temp_dir.path(), &engine);
    let boot = coordinator.boot().await;

    assert_eq!(boot.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert!(engine.running(PipelineKind::Recording).is_empty());
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
}
