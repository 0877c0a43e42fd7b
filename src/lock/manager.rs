//! Lock Manager (Mode Arbiter)
//!
//! Owns the durable exclusivity token and is the single arbiter of camera
//! hardware access.
//!
//! Rules:
//! - idle → anything: granted
//! - preview requested while recording held: denied unless `force`
//! - recording requested while preview held: always granted; stopping the
//!   preview pipelines is the caller's job
//! - same holder, same mode: idempotent success, no new grant
//! - different holder, same mode: denied unless `force`
//!
//! Every read-modify-write runs under an in-process mutex and a cross-process
//! guard file, against the record freshly read from disk. The Lock Manager
//! never double-grants a non-idle mode.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::{LockError, LockResult};
use super::liveness::HolderLiveness;
use super::token::{ExclusivityToken, Mode};
use crate::crash_point::points;
use crate::observability::{ActivityLog, Event, MetricsRegistry};
use crate::store::{DurableRecord, FileGuard};

const TOKEN_FILE_NAME: &str = "token.json";
const GUARD_FILE_NAME: &str = "token.guard";

/// Lock Manager tuning
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Age after which a hold with a dead holder is reclaimable
    pub stale_threshold: Duration,
    /// How long to wait for the cross-process guard
    pub guard_wait: Duration,
    /// Age after which a leftover guard file is broken
    pub guard_stale_after: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(60),
            guard_wait: Duration::from_secs(2),
            guard_stale_after: Duration::from_secs(10),
        }
    }
}

/// Why an acquire was refused.
///
/// Always names the current holder and whether `force` would succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub requested: Mode,
    pub held_mode: Mode,
    pub holder_id: String,
    pub force_would_succeed: bool,
    pub reason: String,
}

/// Result of an acquire attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// New hold written
    Granted {
        mode: Mode,
        previous: Mode,
        forced: bool,
        displaced: Option<String>,
    },
    /// Caller already held this mode
    AlreadyHeld { mode: Mode },
    /// Refused, token unchanged
    Denied(Denial),
}

impl AcquireOutcome {
    /// True for both fresh grants and idempotent re-acquires
    pub fn is_granted(&self) -> bool {
        !matches!(self, AcquireOutcome::Denied(_))
    }

    /// Mode that was displaced by a fresh grant
    pub fn previous_mode(&self) -> Option<Mode> {
        match self {
            AcquireOutcome::Granted { previous, .. } => Some(*previous),
            _ => None,
        }
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            AcquireOutcome::Denied(denial) => Some(denial),
            _ => None,
        }
    }
}

/// Result of a release request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    AlreadyIdle,
    NotHolder { held_mode: Mode, holder_id: String },
}

/// Read-only view of the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub mode: Mode,
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub force_flag: bool,
    pub can_preview: bool,
    pub can_record: bool,
}

impl LockStatus {
    fn from_token(token: &ExclusivityToken) -> Self {
        let recording = token.mode == Mode::Recording;
        Self {
            mode: token.mode,
            holder: token.holder_id.clone(),
            acquired_at: token.acquired_at,
            force_flag: token.force_flag,
            can_preview: !recording,
            can_record: !recording,
        }
    }
}

enum Decision {
    Grant { forced: bool },
    AlreadyHeld,
    Deny { reason: String },
}

fn decide(current: &ExclusivityToken, mode: Mode, holder_id: &str, force: bool) -> Decision {
    if current.is_idle() {
        return Decision::Grant { forced: false };
    }
    if current.is_held_by(mode, holder_id) {
        return Decision::AlreadyHeld;
    }

    match (current.mode, mode) {
        (Mode::Preview, Mode::Recording) => Decision::Grant { forced: false },
        _ if force => Decision::Grant { forced: true },
        (Mode::Recording, Mode::Preview) => Decision::Deny {
            reason: format!(
                "recording in progress (holder '{}'); preview requires force",
                current.holder_label()
            ),
        },
        _ => Decision::Deny {
            reason: format!(
                "{} held by '{}'; force would take over",
                current.mode,
                current.holder_label()
            ),
        },
    }
}

/// The mode arbiter
pub struct LockManager {
    record: DurableRecord<ExclusivityToken>,
    guard_path: PathBuf,
    config: LockManagerConfig,
    liveness: Arc<dyn HolderLiveness>,
    local: Mutex<()>,
    activity: Arc<ActivityLog>,
    metrics: Arc<MetricsRegistry>,
}

impl LockManager {
    /// Open the token stored under `state_dir`.
    pub fn open(
        state_dir: &Path,
        config: LockManagerConfig,
        liveness: Arc<dyn HolderLiveness>,
        activity: Arc<ActivityLog>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            record: DurableRecord::new(state_dir, TOKEN_FILE_NAME)
                .with_crash_points(points::TOKEN_BEFORE_RENAME, points::TOKEN_AFTER_RENAME),
            guard_path: state_dir.join(GUARD_FILE_NAME),
            config,
            liveness,
            local: Mutex::new(()),
            activity,
            metrics,
        }
    }

    /// Request `mode` for `holder_id`.
    pub fn acquire(&self, mode: Mode, holder_id: &str, force: bool) -> LockResult<AcquireOutcome> {
        if mode.is_idle() {
            return Err(LockError::InvalidMode(mode));
        }
        let pid = std::process::id();

        let outcome = self.with_token(|token| match decide(token, mode, holder_id, force) {
            Decision::Grant { forced } => {
                let previous = token.mode;
                let displaced = token.holder_id.clone();
                *token = ExclusivityToken::held(mode, holder_id, pid, forced);
                (
                    AcquireOutcome::Granted {
                        mode,
                        previous,
                        forced,
                        displaced,
                    },
                    true,
                )
            }
            Decision::AlreadyHeld => {
                let refreshed = token.holder_pid != Some(pid);
                token.holder_pid = Some(pid);
                (AcquireOutcome::AlreadyHeld { mode }, refreshed)
            }
            Decision::Deny { reason } => (
                AcquireOutcome::Denied(Denial {
                    requested: mode,
                    held_mode: token.mode,
                    holder_id: token.holder_label(),
                    force_would_succeed: true,
                    reason,
                }),
                false,
            ),
        })?;

        match &outcome {
            AcquireOutcome::Granted {
                previous,
                forced,
                displaced,
                ..
            } => {
                self.metrics.increment_locks_granted();
                let event = if *forced {
                    Event::LockForced
                } else {
                    Event::LockGranted
                };
                self.activity.record(
                    event,
                    format!(
                        "{} granted to '{}' (previous {}, displaced {})",
                        mode,
                        holder_id,
                        previous,
                        displaced.as_deref().unwrap_or("-")
                    ),
                );
            }
            AcquireOutcome::AlreadyHeld { .. } => {
                self.activity.record(
                    Event::LockAlreadyHeld,
                    format!("{} already held by '{}'", mode, holder_id),
                );
            }
            AcquireOutcome::Denied(denial) => {
                self.metrics.increment_locks_denied();
                self.activity.record(
                    Event::LockDenied,
                    format!("{} denied to '{}': {}", mode, holder_id, denial.reason),
                );
            }
        }

        Ok(outcome)
    }

    /// Return `mode` to idle if `holder_id` holds it.
    ///
    /// Releasing an idle token or one held by someone else is a logged no-op.
    pub fn release(&self, mode: Mode, holder_id: &str) -> LockResult<ReleaseOutcome> {
        if mode.is_idle() {
            return Err(LockError::InvalidMode(mode));
        }

        let outcome = self.with_token(|token| {
            if token.is_idle() {
                (ReleaseOutcome::AlreadyIdle, false)
            } else if token.is_held_by(mode, holder_id) {
                *token = ExclusivityToken::idle();
                (ReleaseOutcome::Released, true)
            } else {
                (
                    ReleaseOutcome::NotHolder {
                        held_mode: token.mode,
                        holder_id: token.holder_label(),
                    },
                    false,
                )
            }
        })?;

        match &outcome {
            ReleaseOutcome::Released => self.activity.record(
                Event::LockReleased,
                format!("{} released by '{}'", mode, holder_id),
            ),
            ReleaseOutcome::AlreadyIdle => self.activity.record(
                Event::LockReleaseIgnored,
                format!("'{}' released {} but token already idle", holder_id, mode),
            ),
            ReleaseOutcome::NotHolder {
                held_mode,
                holder_id: actual,
            } => self.activity.record(
                Event::LockReleaseIgnored,
                format!(
                    "'{}' released {} but token is {} held by '{}'",
                    holder_id, mode, held_mode, actual
                ),
            ),
        }

        Ok(outcome)
    }

    /// Force a stale hold back to idle.
    ///
    /// A hold is stale when it is older than the threshold and its holder
    /// process cannot be confirmed alive. Returns the reclaimed token.
    pub fn reclaim_stale(&self) -> LockResult<Option<ExclusivityToken>> {
        let now = Utc::now();
        let threshold = self.config.stale_threshold;
        let liveness = Arc::clone(&self.liveness);

        let reclaimed = self.with_token(|token| {
            if token.is_idle() {
                return (None, false);
            }
            let old_enough = match token.age(now) {
                Some(age) => age.to_std().map(|a| a > threshold).unwrap_or(false),
                None => true,
            };
            let alive = token
                .holder_pid
                .map(|pid| liveness.is_alive(pid))
                .unwrap_or(false);

            if old_enough && !alive {
                let previous = token.clone();
                *token = ExclusivityToken::idle();
                (Some(previous), true)
            } else {
                (None, false)
            }
        })?;

        if let Some(previous) = &reclaimed {
            self.metrics.increment_locks_reclaimed();
            self.activity.record(
                Event::LockReclaimed,
                format!(
                    "stale {} hold of '{}' (pid {:?}) reclaimed to idle",
                    previous.mode,
                    previous.holder_label(),
                    previous.holder_pid
                ),
            );
        }

        Ok(reclaimed)
    }

    /// Current mode, holder and what could be started. No side effects.
    pub fn query(&self) -> LockResult<LockStatus> {
        Ok(LockStatus::from_token(&self.token()?))
    }

    /// Current token as stored. A corrupt record reads as idle.
    pub fn token(&self) -> LockResult<ExclusivityToken> {
        match self.record.read() {
            Ok(token) => Ok(token.unwrap_or_default()),
            Err(e) if e.is_corrupt() => Ok(ExclusivityToken::idle()),
            Err(e) => Err(e.into()),
        }
    }

    /// True if `holder_id` currently holds `mode`
    pub fn holds(&self, mode: Mode, holder_id: &str) -> LockResult<bool> {
        Ok(self.token()?.is_held_by(mode, holder_id))
    }

    /// `acquire` on the blocking pool.
    ///
    /// Mutations may sleep waiting for the cross-process guard, which must
    /// not happen on a runtime worker.
    pub async fn acquire_async(
        self: &Arc<Self>,
        mode: Mode,
        holder_id: &str,
        force: bool,
    ) -> LockResult<AcquireOutcome> {
        let holder_id = holder_id.to_string();
        self.off_runtime(move |lock| lock.acquire(mode, &holder_id, force))
            .await
    }

    /// `release` on the blocking pool
    pub async fn release_async(
        self: &Arc<Self>,
        mode: Mode,
        holder_id: &str,
    ) -> LockResult<ReleaseOutcome> {
        let holder_id = holder_id.to_string();
        self.off_runtime(move |lock| lock.release(mode, &holder_id))
            .await
    }

    /// `reclaim_stale` on the blocking pool
    pub async fn reclaim_stale_async(self: &Arc<Self>) -> LockResult<Option<ExclusivityToken>> {
        self.off_runtime(|lock| lock.reclaim_stale()).await
    }

    async fn off_runtime<R, F>(self: &Arc<Self>, op: F) -> LockResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&LockManager) -> LockResult<R> + Send + 'static,
    {
        let lock = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&lock))
            .await
            .map_err(|e| LockError::Task(e.to_string()))?
    }

    fn with_token<R>(
        &self,
        f: impl FnOnce(&mut ExclusivityToken) -> (R, bool),
    ) -> LockResult<R> {
        let _local = self.local.lock().map_err(|_| LockError::Poisoned)?;
        let liveness = Arc::clone(&self.liveness);
        let _guard = FileGuard::acquire(
            &self.guard_path,
            self.config.guard_wait,
            self.config.guard_stale_after,
            |pid| liveness.is_alive(pid),
        )?;

        let mut token = match self.record.read() {
            Ok(token) => token.unwrap_or_default(),
            Err(e) if e.is_corrupt() => {
                self.activity
                    .record(Event::LockCorrupt, format!("{}; treating as idle", e));
                ExclusivityToken::idle()
            }
            Err(e) => return Err(e.into()),
        };

        let (result, dirty) = f(&mut token);
        if dirty {
            self.record.write_atomic(&token)?;
        }
        Ok(result)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("token_path", &self.record.path())
            .field("config", &self.config)
            .finish()
    }
}
