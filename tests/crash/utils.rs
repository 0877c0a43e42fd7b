//! Crash testing utilities
//!
//! These utilities support:
//! - Creating temp data directories
//! - Opening a coordinator over a crashed data dir
//! - Validating post-crash state

use std::fs;
use std::path::Path;
use std::sync::Arc;

use dualcam::config::CoordinatorConfig;
use dualcam::coordinator::Coordinator;
use dualcam::engine::SimulatedEngine;
use tempfile::TempDir;

/// Session id every crash child records under
pub const CRASH_SESSION_ID: &str = "crash-take";

/// Create a temporary data directory for crash testing
pub fn create_temp_data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// Config shared by parent and child: no protection window, short bounds
pub fn crash_config(data_dir: &Path) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::rooted_at(data_dir);
    config.recording.protection_seconds = 0;
    config.recording.stop_timeout_ms = 200;
    config.preview.stop_timeout_ms = 200;
    config
}

/// Coordinator over `data_dir` driving `engine`
pub fn open_with_engine(data_dir: &Path, engine: &SimulatedEngine) -> Coordinator {
    Coordinator::with_engine(crash_config(data_dir), Arc::new(engine.clone()))
        .expect("Failed to build coordinator")
}

/// Coordinator over `data_dir` with a fresh engine, as after a process restart
pub fn open_fresh(data_dir: &Path) -> (Coordinator, SimulatedEngine) {
    let engine = SimulatedEngine::new();
    let coordinator = open_with_engine(data_dir, &engine);
    (coordinator, engine)
}

/// Committed records must always parse; a crash may only leave a stale
/// temp file beside them.
pub fn validate_durable_state(coordinator: &Coordinator) -> Result<(), String> {
    coordinator
        .lock()
        .token()
        .map_err(|e| format!("token unreadable: {}", e))?;
    coordinator
        .recording()
        .persisted_session()
        .map_err(|e| format!("session unreadable: {}", e))?;
    Ok(())
}

/// Names of files under the state dir, sorted
pub fn state_files(data_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(data_dir.join("state"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_dir_has_valid_state() {
        let temp_dir = create_temp_data_dir();
        let (coordinator, _engine) = open_fresh(temp_dir.path());
        assert!(validate_durable_state(&coordinator).is_ok());
        assert!(state_files(temp_dir.path()).is_empty());
    }
}
