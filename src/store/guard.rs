//! Cross-process guard file
//!
//! Serializes read-modify-write cycles on a durable record between separate
//! processes. The guard is a file created with `create_new`; whoever creates
//! it owns the critical section until the guard is dropped.
//!
//! The guard holds `"<pid> <nonce>"`. A guard left behind by a crashed
//! process is broken once its owner pid is confirmed dead, or once it is
//! older than the configured staleness bound (an owner that overruns it is
//! presumed gone).
//!
//! Breaking goes through a second `create_new` file next to the guard, so at
//! most one process judges and removes an abandoned guard at a time. Only
//! breakers remove a guard they do not own, and an owner only removes the
//! guard if it still carries its own nonce.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

use super::errors::{StoreError, StoreResult};

const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Held guard; the file is removed on drop if it is still ours.
#[derive(Debug)]
pub struct FileGuard {
    path: PathBuf,
    stamp: String,
}

impl FileGuard {
    /// Acquire the guard at `path`, waiting at most `wait`.
    ///
    /// An existing guard is broken when its mtime is older than
    /// `stale_after` or `owner_alive` rejects the pid written inside it.
    /// Guards owned by this process are never judged dead.
    pub fn acquire(
        path: &Path,
        wait: Duration,
        stale_after: Duration,
        owner_alive: impl Fn(u32) -> bool,
    ) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("create_dir", parent, e))?;
        }

        let stamp = format!("{} {}", std::process::id(), Uuid::new_v4().simple());
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", stamp);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        stamp,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::try_break(path, stale_after, &owner_alive)? {
                        continue;
                    }
                }
                Err(e) => return Err(StoreError::io("create_guard", path, e)),
            }

            if Instant::now() >= deadline {
                return Err(StoreError::GuardTimeout {
                    path: path.to_path_buf(),
                });
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Remove an abandoned guard while holding the break file.
    ///
    /// Returns true if the guard at `path` was removed.
    fn try_break(
        path: &Path,
        stale_after: Duration,
        owner_alive: &impl Fn(u32) -> bool,
    ) -> StoreResult<bool> {
        if !Self::abandoned(path, stale_after, owner_alive) {
            return Ok(false);
        }

        let break_path = Self::break_path(path);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&break_path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Left behind by a breaker that died mid-break
                if Self::abandoned(&break_path, stale_after, owner_alive) {
                    let _ = fs::remove_file(&break_path);
                }
                return Ok(false);
            }
            Err(e) => return Err(StoreError::io("create_guard_break", &break_path, e)),
        }

        // Judged again under the break file: whatever is at `path` now can
        // only be replaced after we remove it.
        let broken = Self::abandoned(path, stale_after, owner_alive) && fs::remove_file(path).is_ok();
        let _ = fs::remove_file(&break_path);
        Ok(broken)
    }

    fn break_path(path: &Path) -> PathBuf {
        path.with_extension("break")
    }

    fn abandoned(path: &Path, stale_after: Duration, owner_alive: &impl Fn(u32) -> bool) -> bool {
        Self::is_stale(path, stale_after) || Self::owner_dead(path, owner_alive)
    }

    fn owner_pid(content: &str) -> Option<u32> {
        content.split_whitespace().next()?.parse().ok()
    }

    fn owner_dead(path: &Path, owner_alive: &impl Fn(u32) -> bool) -> bool {
        let Ok(content) = fs::read_to_string(path) else {
            return false;
        };
        match Self::owner_pid(&content) {
            Some(pid) if pid != std::process::id() => !owner_alive(pid),
            _ => false,
        }
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > stale_after)
            .unwrap_or(false)
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .map(|content| content.trim() == self.stamp)
            .unwrap_or(false);
        if ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}
