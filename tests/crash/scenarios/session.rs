//! Session record crash scenarios

use crate::crash::harness::{report_failure, run_child_with_crash_point, ChildOperation};
use crate::crash::utils::{
    create_temp_data_dir, open_fresh, state_files, validate_durable_state, CRASH_SESSION_ID,
};
use dualcam::crash_point::points;
use dualcam::errors::ErrorKind;
use dualcam::lock::Mode;
use dualcam::recording::{RecoveryOutcome, SessionState};

/// Crash before the first session commit: token held, no session.
#[tokio::test]
async fn test_crash_before_session_rename() {
    let temp_dir = create_temp_data_dir();
    let point = points::SESSION_BEFORE_RENAME;

    let result = run_child_with_crash_point(point, ChildOperation::Start, temp_dir.path());
    if !result.hit_crash_point(point) {
        report_failure(point, "child aborts at crash point", &result);
        panic!("child did not crash at {}", point);
    }

    assert!(state_files(temp_dir.path()).contains(&"session.json.tmp".to_string()));

    let (coordinator, _engine) = open_fresh(temp_dir.path());
    assert!(validate_durable_state(&coordinator).is_ok());
    assert!(coordinator.recording().persisted_session().unwrap().is_none());

    let boot = coordinator.boot().await;
    assert_eq!(boot.recovery.outcome, RecoveryOutcome::NothingToRecover);
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
}

/// Crash after `Starting` is committed: no pipeline can be confirmed, so
/// the session is marked failed and the lock released.
#[tokio::test]
async fn test_crash_after_session_rename_marks_failed() {
    let temp_dir = create_temp_data_dir();
    let point = points::SESSION_AFTER_RENAME;

    let result = run_child_with_crash_point(point, ChildOperation::Start, temp_dir.path());
    if !result.hit_crash_point(point) {
        report_failure(point, "child aborts at crash point", &result);
        panic!("child did not crash at {}", point);
    }

    let (coordinator, engine) = open_fresh(temp_dir.path());
    let persisted = coordinator.recording().persisted_session().unwrap().unwrap();
    assert_eq!(persisted.session_id, CRASH_SESSION_ID);
    assert_eq!(persisted.state, SessionState::Starting);

    let boot = coordinator.boot().await;
    assert_eq!(boot.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert_eq!(boot.recovery.error, Some(ErrorKind::CrashRecoveryMismatch));
    assert_eq!(
        boot.recovery.session_id.as_deref(),
        Some(CRASH_SESSION_ID)
    );
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
    assert_eq!(engine.start_calls(), 0);

    let persisted = coordinator.recording().persisted_session().unwrap().unwrap();
    assert_eq!(persisted.state, SessionState::Failed);
}

/// Recovery of the same crashed state is deterministic and converges: a
/// second boot finds nothing left to do.
#[tokio::test]
async fn test_recovery_converges() {
    let temp_dir = create_temp_data_dir();
    let point = points::SESSION_AFTER_RENAME;

    let result = run_child_with_crash_point(point, ChildOperation::Start, temp_dir.path());
    assert!(result.hit_crash_point(point), "{}", result.stderr);

    let first = {
        let (coordinator, _engine) = open_fresh(temp_dir.path());
        coordinator.boot().await
    };
    let (coordinator, _engine) = open_fresh(temp_dir.path());
    let second = coordinator.boot().await;

    assert_eq!(first.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert_eq!(second.recovery.outcome, RecoveryOutcome::NothingToRecover);
    assert_eq!(second.recovery.session_id, first.recovery.session_id);
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
}

/// A corrupt session record is reported as a mismatch and removed.
#[tokio::test]
async fn test_corrupt_session_record() {
    let temp_dir = create_temp_data_dir();
    {
        let (coordinator, _engine) = open_fresh(temp_dir.path());
        let report = coordinator
            .recording()
            .start(Some(CRASH_SESSION_ID.to_string()), false)
            .await;
        assert!(report.success);
    }
    std::fs::write(temp_dir.path().join("state/session.json"), b"{\"checksum\": 1").unwrap();

    let (coordinator, _engine) = open_fresh(temp_dir.path());
    assert!(validate_durable_state(&coordinator).is_err());

    let boot = coordinator.boot().await;
    assert_eq!(boot.recovery.outcome, RecoveryOutcome::MarkedFailed);
    assert_eq!(boot.recovery.error, Some(ErrorKind::CrashRecoveryMismatch));
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
    assert!(validate_durable_state(&coordinator).is_ok());
}
