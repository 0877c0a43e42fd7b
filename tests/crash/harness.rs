//! Crash test harness for subprocess management
//!
//! The harness:
//! - Re-executes the current test binary, running only `crash_child`
//! - Injects the crash via `DUALCAM_CRASH_POINT`
//! - Hands the child its data dir and operation through env vars

use std::path::Path;
use std::process::{Command, ExitStatus};

use dualcam::crash_point::CRASH_POINT_ENV;

/// Data dir handed to the child
pub const CHILD_DIR_ENV: &str = "DUALCAM_CRASH_CHILD_DIR";

/// Operation the child performs before it is expected to die
pub const CHILD_OPERATION_ENV: &str = "DUALCAM_CRASH_CHILD_OPERATION";

/// Name of the test function the child runs
pub const CHILD_TEST_NAME: &str = "crash_child";

/// What the child does against its coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOperation {
    /// `recording.start`
    Start,
    /// `recording.start` followed by a forced stop
    StartThenStop,
}

impl ChildOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StartThenStop => "start_then_stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "start_then_stop" => Some(Self::StartThenStop),
            _ => None,
        }
    }
}

/// Result of a crash test execution
#[derive(Debug)]
pub struct CrashTestResult {
    /// Whether the process died instead of exiting cleanly
    pub crashed: bool,
    /// Exit status if available
    pub exit_status: Option<ExitStatus>,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
}

impl CrashTestResult {
    /// True when the child announced the crash point before aborting
    pub fn hit_crash_point(&self, crash_point: &str) -> bool {
        self.crashed
            && self
                .stderr
                .contains(&format!("Triggering crash at point: {}", crash_point))
    }
}

/// Run `operation` in a child process with `crash_point` enabled
pub fn run_child_with_crash_point(
    crash_point: &str,
    operation: ChildOperation,
    data_dir: &Path,
) -> CrashTestResult {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            return CrashTestResult {
                crashed: false,
                exit_status: None,
                stdout: String::new(),
                stderr: format!("Cannot locate test binary: {}", e),
            }
        }
    };

    let output = Command::new(exe)
        .args([
            "--ignored",
            "--exact",
            CHILD_TEST_NAME,
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CRASH_POINT_ENV, crash_point)
        .env(CHILD_DIR_ENV, data_dir)
        .env(CHILD_OPERATION_ENV, operation.as_str())
        .output();

    match output {
        Ok(output) => CrashTestResult {
            crashed: !output.status.success(),
            exit_status: Some(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(e) => CrashTestResult {
            crashed: false,
            exit_status: None,
            stdout: String::new(),
            stderr: format!("Failed to execute: {}", e),
        },
    }
}

/// Report crash test failure
pub fn report_failure(crash_point: &str, expected: &str, result: &CrashTestResult) {
    eprintln!("=== CRASH TEST FAILURE ===");
    eprintln!("Crash point: {}", crash_point);
    eprintln!("Expected: {}", expected);
    eprintln!("Exit status: {:?}", result.exit_status);
    eprintln!("Child stdout:\n{}", result.stdout);
    eprintln!("Child stderr:\n{}", result.stderr);
    eprintln!("==========================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_roundtrip() {
        for op in [ChildOperation::Start, ChildOperation::StartThenStop] {
            assert_eq!(ChildOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(ChildOperation::parse("reboot"), None);
    }
}
