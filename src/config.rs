//! Coordinator configuration
//!
//! A single JSON file (default `./dualcam.json`). Every field is optional;
//! omitted fields take the defaults below. The loaded file is validated
//! before anything is opened.
//!
//! ```json
//! {
//!   "state_dir": "/var/lib/dualcam",
//!   "recordings_dir": "/data/recordings",
//!   "cameras": [{ "id": 0, "device": "/dev/video0" }, { "id": 1, "device": "/dev/video2" }],
//!   "recording": { "protection_seconds": 10, "require_all_cameras": true },
//!   "engine": { "kind": "process", "recording_argv": ["ffmpeg", "-i", "{device}", "{output}"] }
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{CameraId, ProcessEngineConfig};
use crate::http_server::HttpServerConfig;
use crate::lock::LockManagerConfig;
use crate::observability::{LogFormat, DEFAULT_ACTIVITY_CAPACITY};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "./dualcam.json";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// One physical camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    pub device: String,
}

/// Exclusivity token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Hold age after which a dead holder's token is reclaimed
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,

    /// Period of the background reclaim pass
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,

    /// Bound on waiting for the cross-process guard file
    #[serde(default = "default_guard_wait_ms")]
    pub guard_wait_ms: u64,
}

fn default_stale_threshold_secs() -> u64 {
    60
}
fn default_reclaim_interval_secs() -> u64 {
    30
}
fn default_guard_wait_ms() -> u64 {
    2000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            guard_wait_ms: default_guard_wait_ms(),
        }
    }
}

impl LockConfig {
    pub fn manager_config(&self) -> LockManagerConfig {
        LockManagerConfig {
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            guard_wait: Duration::from_millis(self.guard_wait_ms),
            ..LockManagerConfig::default()
        }
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

/// Recording lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Non-forced stops are rejected for this long after start
    #[serde(default = "default_protection_seconds")]
    pub protection_seconds: u64,

    /// All-or-nothing camera start policy
    #[serde(default = "default_true")]
    pub require_all_cameras: bool,

    #[serde(default = "default_engine_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Bound on graceful end-of-stream per camera
    #[serde(default = "default_engine_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_protection_seconds() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_engine_timeout_ms() -> u64 {
    5000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            protection_seconds: default_protection_seconds(),
            require_all_cameras: true,
            start_timeout_ms: default_engine_timeout_ms(),
            stop_timeout_ms: default_engine_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Preview lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_engine_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Bound on hard stop per camera
    #[serde(default = "default_preview_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_preview_stop_timeout_ms() -> u64 {
    1000
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_engine_timeout_ms(),
            stop_timeout_ms: default_preview_stop_timeout_ms(),
        }
    }
}

/// Recording health monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    /// Segment growth may pause this long before a camera counts as stalled
    #[serde(default = "default_stall_interval_secs")]
    pub stall_interval_secs: u64,

    /// Pipeline restarts per camera before it is marked degraded
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_health_interval_secs() -> u64 {
    10
}
fn default_stall_interval_secs() -> u64 {
    15
}
fn default_max_recovery_attempts() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            stall_interval_secs: default_stall_interval_secs(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

/// Which pipeline engine drives the cameras
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Simulated,
    Process,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,

    /// argv template; `{camera}`, `{device}`, `{output}` are substituted
    #[serde(default)]
    pub recording_argv: Vec<String>,

    #[serde(default)]
    pub preview_argv: Vec<String>,
}

impl EngineConfig {
    pub fn process_config(&self) -> ProcessEngineConfig {
        ProcessEngineConfig {
            recording_argv: self.recording_argv.clone(),
            preview_argv: self.preview_argv.clone(),
        }
    }
}

/// Command plane server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPlaneConfig {
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,

    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    #[serde(default = "default_health_broadcast_ms")]
    pub health_interval_ms: u64,

    /// Connections silent for longer than this are closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_idempotency_capacity() -> usize {
    200
}
fn default_idempotency_ttl_secs() -> u64 {
    60
}
fn default_status_interval_ms() -> u64 {
    1000
}
fn default_metrics_interval_ms() -> u64 {
    3000
}
fn default_health_broadcast_ms() -> u64 {
    5000
}
fn default_idle_timeout_secs() -> u64 {
    90
}

impl Default for CommandPlaneConfig {
    fn default() -> Self {
        Self {
            idempotency_capacity: default_idempotency_capacity(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            status_interval_ms: default_status_interval_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            health_interval_ms: default_health_broadcast_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Command-plane client reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// No message of any kind within this window forces a reconnect
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

fn default_reconnect_base_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_receive_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

/// Top-level coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Logical identity used as the lock holder prefix
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Token and session records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Segment output root
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,

    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub preview: PreviewConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub command_plane: CommandPlaneConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub http: HttpServerConfig,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_activity_capacity")]
    pub activity_capacity: usize,
}

fn default_node_id() -> String {
    "dualcam".to_string()
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}
fn default_recordings_dir() -> PathBuf {
    PathBuf::from("./recordings")
}
fn default_cameras() -> Vec<CameraConfig> {
    vec![
        CameraConfig {
            id: 0,
            device: "/dev/video0".to_string(),
        },
        CameraConfig {
            id: 1,
            device: "/dev/video1".to_string(),
        },
    ]
}
fn default_activity_capacity() -> usize {
    DEFAULT_ACTIVITY_CAPACITY
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            state_dir: default_state_dir(),
            recordings_dir: default_recordings_dir(),
            cameras: default_cameras(),
            lock: LockConfig::default(),
            recording: RecordingConfig::default(),
            preview: PreviewConfig::default(),
            health: HealthConfig::default(),
            engine: EngineConfig::default(),
            command_plane: CommandPlaneConfig::default(),
            client: ClientConfig::default(),
            http: HttpServerConfig::default(),
            log_format: LogFormat::default(),
            activity_capacity: default_activity_capacity(),
        }
    }
}

impl CoordinatorConfig {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: CoordinatorConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `base`: state and recordings live underneath it
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            state_dir: base.join("state"),
            recordings_dir: base.join("recordings"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(invalid("node_id must not be empty"));
        }
        if self.cameras.is_empty() {
            return Err(invalid("at least one camera must be configured"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(invalid(format!("duplicate camera id {}", camera.id)));
            }
            if camera.device.trim().is_empty() {
                return Err(invalid(format!("camera {} has no device", camera.id)));
            }
        }

        let timeouts = [
            ("lock.stale_threshold_secs", self.lock.stale_threshold_secs),
            ("lock.reclaim_interval_secs", self.lock.reclaim_interval_secs),
            ("lock.guard_wait_ms", self.lock.guard_wait_ms),
            ("recording.start_timeout_ms", self.recording.start_timeout_ms),
            ("recording.stop_timeout_ms", self.recording.stop_timeout_ms),
            ("recording.probe_timeout_ms", self.recording.probe_timeout_ms),
            ("preview.start_timeout_ms", self.preview.start_timeout_ms),
            ("preview.stop_timeout_ms", self.preview.stop_timeout_ms),
            ("health.interval_secs", self.health.interval_secs),
            ("health.stall_interval_secs", self.health.stall_interval_secs),
            ("command_plane.idempotency_ttl_secs", self.command_plane.idempotency_ttl_secs),
            ("command_plane.status_interval_ms", self.command_plane.status_interval_ms),
            ("command_plane.metrics_interval_ms", self.command_plane.metrics_interval_ms),
            ("command_plane.health_interval_ms", self.command_plane.health_interval_ms),
            ("command_plane.idle_timeout_secs", self.command_plane.idle_timeout_secs),
            ("client.reconnect_base_ms", self.client.reconnect_base_ms),
            ("client.receive_timeout_ms", self.client.receive_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(invalid(format!("{} must be > 0", name)));
            }
        }

        if self.command_plane.idempotency_capacity == 0 {
            return Err(invalid("command_plane.idempotency_capacity must be > 0"));
        }
        if self.client.reconnect_base_ms > self.client.reconnect_max_ms {
            return Err(invalid(
                "client.reconnect_base_ms must not exceed client.reconnect_max_ms",
            ));
        }
        if self.activity_capacity == 0 {
            return Err(invalid("activity_capacity must be > 0"));
        }

        if self.engine.kind == EngineKind::Process {
            if self.engine.recording_argv.is_empty() {
                return Err(invalid("engine.recording_argv is required for the process engine"));
            }
            if self.engine.preview_argv.is_empty() {
                return Err(invalid("engine.preview_argv is required for the process engine"));
            }
        }

        Ok(())
    }

    /// Device path for a configured camera
    pub fn device(&self, camera_id: CameraId) -> Option<&str> {
        self.cameras
            .iter()
            .find(|c| c.id == camera_id)
            .map(|c| c.device.as_str())
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.iter().map(|c| c.id).collect()
    }
}
