//! Remote command execution
//!
//! Maps remote actions onto the serialized controllers. Both the WebSocket
//! path and the one-shot request facade go through `CommandExecutor::submit`
//! so a logical command executes once regardless of which path, or how many
//! retries, delivered it.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::idempotency::{Claim, IdempotencyCache};
use super::protocol::{AckStatus, Channel, CommandOutcome};
use crate::engine::CameraId;
use crate::errors::ErrorKind;
use crate::lock::{LockManager, LockStatus};
use crate::observability::{ActivityLog, Event, MetricsRegistry, MetricsSnapshot};
use crate::preview::{PreviewController, PreviewReport, PreviewSession};
use crate::recording::{RecordingController, RecordingStatus};

const DEFAULT_LOG_LIMIT: usize = 100;

/// Actions accepted in `command{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    RecordingStart,
    RecordingStop,
    PreviewStart,
    PreviewStop,
    PreviewRestart,
    StatusGet,
    LockGet,
    LogsGet,
    HealthGet,
}

impl RemoteAction {
    pub fn parse(action: &str) -> Option<Self> {
        let parsed = match action {
            "recording.start" => Self::RecordingStart,
            "recording.stop" => Self::RecordingStop,
            "preview.start" => Self::PreviewStart,
            "preview.stop" => Self::PreviewStop,
            "preview.restart" => Self::PreviewRestart,
            "status.get" => Self::StatusGet,
            "lock.get" => Self::LockGet,
            "logs.get" => Self::LogsGet,
            "health.get" => Self::HealthGet,
            _ => return None,
        };
        Some(parsed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordingStart => "recording.start",
            Self::RecordingStop => "recording.stop",
            Self::PreviewStart => "preview.start",
            Self::PreviewStop => "preview.stop",
            Self::PreviewRestart => "preview.restart",
            Self::StatusGet => "status.get",
            Self::LockGet => "lock.get",
            Self::LogsGet => "logs.get",
            Self::HealthGet => "health.get",
        }
    }

    /// Read-only actions never change controller state
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::StatusGet | Self::LockGet | Self::LogsGet | Self::HealthGet
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordingStartParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordingStopParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreviewParams {
    #[serde(default, alias = "camera")]
    camera_id: Option<CameraId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogsParams {
    #[serde(default)]
    limit: Option<usize>,
}

fn parse_params<T: DeserializeOwned + Default>(params: Value) -> Result<T, CommandOutcome> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| {
        CommandOutcome::failed(
            ErrorKind::Validation.code(),
            format!("malformed params: {}", e),
        )
    })
}

/// Combined view served by `status.get` and the `status` channel
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub node_id: String,
    pub recording: RecordingStatus,
    pub preview: Vec<PreviewSession>,
    pub lock: Option<LockStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_error: Option<String>,
    pub metrics: MetricsSnapshot,
}

fn report_outcome<T: Serialize>(
    success: bool,
    reason: &str,
    error: Option<ErrorKind>,
    report: &T,
) -> CommandOutcome {
    let data = serde_json::to_value(report).unwrap_or(Value::Null);
    if success {
        CommandOutcome::ok(data)
    } else {
        let code = error.unwrap_or(ErrorKind::Validation).code();
        CommandOutcome::failed_with(code, reason, data)
    }
}

fn preview_outcome(report: &PreviewReport) -> CommandOutcome {
    report_outcome(report.success, &report.reason, report.error, report)
}

pub struct CommandExecutor {
    node_id: String,
    recording: Arc<RecordingController>,
    preview: Arc<PreviewController>,
    lock: Arc<LockManager>,
    cache: IdempotencyCache,
    activity: Arc<ActivityLog>,
    metrics: Arc<MetricsRegistry>,
}

impl CommandExecutor {
    pub fn new(
        node_id: impl Into<String>,
        recording: Arc<RecordingController>,
        preview: Arc<PreviewController>,
        lock: Arc<LockManager>,
        cache: IdempotencyCache,
        activity: Arc<ActivityLog>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            recording,
            preview,
            lock,
            cache,
            activity,
            metrics,
        }
    }

    /// Run a command at most once per `command_id`.
    ///
    /// `on_ack` is called before any waiting: `Received` for a fresh id,
    /// `Processing` when the same id is already executing. A completed
    /// duplicate skips the ack and returns the cached outcome.
    pub async fn submit<F>(
        &self,
        command_id: Option<&str>,
        action: &str,
        params: Value,
        on_ack: F,
    ) -> CommandOutcome
    where
        F: FnOnce(AckStatus),
    {
        let Some(id) = command_id else {
            on_ack(AckStatus::Received);
            return self.execute(action, params).await;
        };

        match self.cache.claim(id) {
            Claim::Execute(completion) => {
                on_ack(AckStatus::Received);
                let outcome = self.execute(action, params).await;
                self.cache.complete(completion, outcome.clone());
                outcome
            }
            Claim::InFlight(rx) => {
                self.note_duplicate(id, action, "in flight");
                on_ack(AckStatus::Processing);
                IdempotencyCache::wait(rx).await
            }
            Claim::Cached(outcome) => {
                self.note_duplicate(id, action, "cached");
                outcome
            }
        }
    }

    fn note_duplicate(&self, id: &str, action: &str, how: &str) {
        self.metrics.increment_duplicate_commands();
        self.activity.record(
            Event::CommandDuplicate,
            format!("command {} ({}) is a duplicate, served {}", id, action, how),
        );
    }

    /// Execute one action without idempotency bookkeeping.
    pub async fn execute(&self, action: &str, params: Value) -> CommandOutcome {
        let Some(remote) = RemoteAction::parse(action) else {
            return CommandOutcome::failed(
                ErrorKind::Validation.code(),
                format!("unknown action '{}'", action),
            );
        };

        let outcome = match self.dispatch(remote, params).await {
            Ok(outcome) | Err(outcome) => outcome,
        };

        self.metrics.increment_commands_executed();
        if !remote.is_read_only() {
            self.activity.record(
                Event::CommandExecuted,
                format!(
                    "{} -> {}",
                    remote.as_str(),
                    if outcome.success { "ok" } else { "failed" }
                ),
            );
        }
        outcome
    }

    async fn dispatch(
        &self,
        action: RemoteAction,
        params: Value,
    ) -> Result<CommandOutcome, CommandOutcome> {
        let outcome = match action {
            RemoteAction::RecordingStart => {
                let p: RecordingStartParams = parse_params(params)?;
                let report = self.recording.start(p.session_id, p.force).await;
                report_outcome(report.success, &report.reason, report.error, &report)
            }
            RemoteAction::RecordingStop => {
                let p: RecordingStopParams = parse_params(params)?;
                let report = self.recording.stop(p.force).await;
                report_outcome(report.success, &report.reason, report.error, &report)
            }
            RemoteAction::PreviewStart => {
                let p: PreviewParams = parse_params(params)?;
                preview_outcome(&self.preview.start(p.camera_id).await)
            }
            RemoteAction::PreviewStop => {
                let p: PreviewParams = parse_params(params)?;
                preview_outcome(&self.preview.stop(p.camera_id).await)
            }
            RemoteAction::PreviewRestart => {
                let p: PreviewParams = parse_params(params)?;
                preview_outcome(&self.preview.restart(p.camera_id).await)
            }
            RemoteAction::StatusGet => CommandOutcome::ok(self.channel_payload(Channel::Status).await),
            RemoteAction::LockGet => match self.lock.query() {
                Ok(status) => CommandOutcome::ok(json!(status)),
                Err(e) => CommandOutcome::failed(ErrorKind::Storage.code(), e.to_string()),
            },
            RemoteAction::LogsGet => {
                let p: LogsParams = parse_params(params)?;
                let limit = p.limit.unwrap_or(DEFAULT_LOG_LIMIT);
                CommandOutcome::ok(json!({ "entries": self.activity.recent(limit) }))
            }
            RemoteAction::HealthGet => CommandOutcome::ok(self.channel_payload(Channel::Health).await),
        };
        Ok(outcome)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let (lock, lock_error) = match self.lock.query() {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e.to_string())),
        };
        CoordinatorStatus {
            node_id: self.node_id.clone(),
            recording: self.recording.status(),
            preview: self.preview.status().await,
            lock,
            lock_error,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Payload published on a broadcast channel
    pub async fn channel_payload(&self, channel: Channel) -> Value {
        match channel {
            Channel::Status => json!(self.status().await),
            Channel::Metrics => json!(self.metrics.snapshot()),
            Channel::Health => json!({ "report": self.recording.last_health().await }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}
