//! Exclusivity token crash scenarios
//!
//! The token is written before any session record exists, so a crash here
//! can at worst leave a recording hold that nothing backs.

use crate::crash::harness::{report_failure, run_child_with_crash_point, ChildOperation};
use crate::crash::utils::{create_temp_data_dir, open_fresh, validate_durable_state};
use dualcam::crash_point::points;
use dualcam::lock::Mode;
use dualcam::recording::RecoveryOutcome;

/// Crash before the token rename: the old (absent) token stands.
#[tokio::test]
async fn test_crash_before_token_rename_leaves_idle() {
    let temp_dir = create_temp_data_dir();
    let point = points::TOKEN_BEFORE_RENAME;

    let result = run_child_with_crash_point(point, ChildOperation::Start, temp_dir.path());
    if !result.hit_crash_point(point) {
        report_failure(point, "child aborts at crash point", &result);
        panic!("child did not crash at {}", point);
    }

    let (coordinator, _engine) = open_fresh(temp_dir.path());
    assert!(validate_durable_state(&coordinator).is_ok());
    assert!(coordinator.lock().token().unwrap().is_idle());

    let boot = coordinator.boot().await;
    assert_eq!(boot.recovery.outcome, RecoveryOutcome::NothingToRecover);
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);
}

/// Crash right after the token commit: the hold is orphaned and released
/// on the next boot.
#[tokio::test]
async fn test_crash_after_token_rename_releases_orphan() {
    let temp_dir = create_temp_data_dir();
    let point = points::TOKEN_AFTER_RENAME;

    let result = run_child_with_crash_point(point, ChildOperation::Start, temp_dir.path());
    if !result.hit_crash_point(point) {
        report_failure(point, "child aborts at crash point", &result);
        panic!("child did not crash at {}", point);
    }

    let (coordinator, engine) = open_fresh(temp_dir.path());
    assert!(validate_durable_state(&coordinator).is_ok());
    let token = coordinator.lock().token().unwrap();
    assert_eq!(token.mode, Mode::Recording);
    assert_ne!(token.holder_pid, Some(std::process::id()));
    assert!(coordinator.recording().persisted_session().unwrap().is_none());

    let boot = coordinator.boot().await;
    assert_eq!(boot.recovery.outcome, RecoveryOutcome::NothingToRecover);
    assert!(boot.recovery.reason.contains("orphaned"));
    assert_eq!(coordinator.lock().query().unwrap().mode, Mode::Idle);

    // Hardware is free again.
    let report = coordinator
        .recording()
        .start(Some("after-crash".to_string()), false)
        .await;
    assert!(report.success, "{}", report.reason);
    assert_eq!(engine.start_calls(), 2);
}
