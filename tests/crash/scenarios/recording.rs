//! Recording lifecycle crash scenarios
//!
//! A crash kills the engine with the coordinator, so the restarted
//! coordinator never finds the old pipelines running.

use crate::crash::harness::{report_failure, run_child_with_crash_point, ChildOperation};
use crate::crash::utils::{create_temp_data_dir, open_fresh, CRASH_SESSION_ID};
use dualcam::crash_point::points;
use dualcam::errors::ErrorKind;
use dualcam::lock::Mode;
use dualcam::recording::{RecoveryOutcome, SessionState};

/// Crash between engine start and the `Recording` commit.
#[tokio::test]
async fn test_crash_after_engine_start() {
    let temp_dir = create_temp_data_dir();
    let point = points::RECORDING_AFTER_ENGINE_START;

    let result = run_child_with_crash_point(point, ChildOperation::Start, temp_dir.path());
    if !result.hit_crash_point(point) {
        report_failure(point, "child aborts after starting pipelines", &result);
        panic!("child did not crash at {}", point);
    }

    let (coordinator, _engine) = open_fresh(temp_dir.path());
    let boot = coordinator.boot().await;

    assert_eq!(boot.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert_eq!(boot.recovery.error, Some(ErrorKind::CrashRecoveryMismatch));
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);

    let status = coordinator.recording().status();
    assert_eq!(status.state, SessionState::Idle);
    let last = status.last_report.expect("failure is reported to status");
    assert_eq!(last.session_id.as_deref(), Some(CRASH_SESSION_ID));
    assert!(last.lock_released);
}

/// Crash after the engine stopped but before the terminal state was
/// committed: the stop outcome is unknowable, so the session fails.
#[tokio::test]
async fn test_crash_after_engine_stop() {
    let temp_dir = create_temp_data_dir();
    let point = points::RECORDING_AFTER_ENGINE_STOP;

    let result =
        run_child_with_crash_point(point, ChildOperation::StartThenStop, temp_dir.path());
    if !result.hit_crash_point(point) {
        report_failure(point, "child aborts after stopping pipelines", &result);
        panic!("child did not crash at {}", point);
    }

    let (coordinator, _engine) = open_fresh(temp_dir.path());
    let persisted = coordinator.recording().persisted_session().unwrap().unwrap();
    assert_eq!(persisted.state, SessionState::Stopping);

    let boot = coordinator.boot().await;
    assert_eq!(boot.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert!(boot.recovery.reason.contains("interrupted"));
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);

    let persisted = coordinator.recording().persisted_session().unwrap().unwrap();
    assert_eq!(persisted.state, SessionState::Failed);
}

/// Every crash point leaves state a fresh coordinator can recover to idle.
#[tokio::test]
async fn test_every_crash_point_recovers_to_idle() {
    for point in points::all() {
        let temp_dir = create_temp_data_dir();
        let operation = if *point == points::RECORDING_AFTER_ENGINE_STOP {
            ChildOperation::StartThenStop
        } else {
            ChildOperation::Start
        };

        let result = run_child_with_crash_point(point, operation, temp_dir.path());
        if !result.hit_crash_point(point) {
            report_failure(point, "child aborts at crash point", &result);
            panic!("child did not crash at {}", point);
        }

        let (coordinator, _engine) = open_fresh(temp_dir.path());
        coordinator.boot().await;
        assert_eq!(
            coordinator.lock().query().unwrap().mode,
            Mode::Idle,
            "lock not idle after crash at {}",
            point
        );
        assert!(
            !coordinator.recording().status().state.is_active(),
            "session still active after crash at {}",
            point
        );
    }
}
