//! Settings consumed by the rotation and shipping pipeline

use crate::{Result, SkiffError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Identity of the running application.
///
/// Built once at startup and shared read-only by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    /// Application name, used in segment names and object keys
    pub name: String,

    /// Build or commit identifier
    pub commit: String,

    /// Per-process session identifier
    pub session_id: String,

    /// Stable per-installation identifier
    pub installation_id: String,

    /// Optional identifier of the signed-in user
    pub user_id: Option<String>,
}

impl AppSettings {
    pub fn new(
        name: impl Into<String>,
        commit: impl Into<String>,
        session_id: impl Into<String>,
        installation_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            commit: commit.into(),
            session_id: session_id.into(),
            installation_id: installation_id.into(),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// How often the active segment is rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationFrequency {
    Hour,
    Minute,
}

impl RotationFrequency {
    /// Length of one rotation interval
    pub fn period(&self) -> Duration {
        match self {
            RotationFrequency::Hour => Duration::from_secs(60 * 60),
            RotationFrequency::Minute => Duration::from_secs(60),
        }
    }

    /// `strftime` pattern naming the interval a rotated segment covers
    pub fn suffix_format(&self) -> &'static str {
        match self {
            RotationFrequency::Hour => "%Y-%m-%d_%H",
            RotationFrequency::Minute => "%Y-%m-%d_%H-%M",
        }
    }
}

impl FromStr for RotationFrequency {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "h" | "hour" | "hourly" => Ok(RotationFrequency::Hour),
            "m" | "minute" => Ok(RotationFrequency::Minute),
            other => Err(SkiffError::InvalidSetting {
                setting: "logging.frequency".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Verbosity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(SkiffError::InvalidSetting {
                setting: "logging.verbosity".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Destination for formatted log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sink {
    /// Rotating segment files, shipped when closed
    File,
    Stdout,
    Stderr,
    /// Accept and discard everything
    Noop,
}

impl FromStr for Sink {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(Sink::File),
            "stdout" => Ok(Sink::Stdout),
            "stderr" => Ok(Sink::Stderr),
            "noop" => Ok(Sink::Noop),
            other => Err(SkiffError::InvalidSetting {
                setting: "logging.sinks".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Parse a comma separated sink list such as `file,stderr`
pub fn parse_sinks(value: &str) -> Result<Vec<Sink>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(Sink::from_str)
        .collect()
}

/// Local log layout and rotation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Root directory; segments live in `<directory>/<installation-id>/`
    pub directory: PathBuf,

    /// Rotation interval
    pub frequency: RotationFrequency,

    /// Enabled sinks
    pub sinks: Vec<Sink>,

    /// Records below this level are dropped
    pub verbosity: LogLevel,

    /// Closed segments kept locally before they are handed off or deleted
    pub backup_count: u32,

    /// Archived and in-flight files older than this are deleted at startup
    pub expiry_horizon_days: u64,

    /// Unshipped files older than this are re-enqueued at startup
    pub recovery_horizon_days: u64,

    /// Upper bound on how long shutdown waits for the shipping worker
    pub close_timeout_secs: u64,

    /// Directory name that marks the application's own tree in paths.
    /// Defaults to the application name.
    pub root_marker: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            frequency: RotationFrequency::Hour,
            sinks: vec![Sink::File],
            verbosity: LogLevel::Info,
            backup_count: 0,
            expiry_horizon_days: 5,
            recovery_horizon_days: 3,
            close_timeout_secs: 3,
            root_marker: None,
        }
    }
}

impl LogSettings {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn expiry_horizon(&self) -> Duration {
        Duration::from_secs(self.expiry_horizon_days * 24 * 60 * 60)
    }

    pub fn recovery_horizon(&self) -> Duration {
        Duration::from_secs(self.recovery_horizon_days * 24 * 60 * 60)
    }

    pub fn has_sink(&self, sink: Sink) -> bool {
        self.sinks.contains(&sink)
    }
}

/// Remote shipping of closed segments
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShippingSettings {
    /// Upload closed segments at all
    pub enabled: bool,

    /// Static credential pair for direct uploads
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    /// Destination bucket for direct uploads
    pub bucket: String,

    pub region: String,

    /// S3-compatible endpoint; defaults to the regional AWS endpoint
    pub endpoint: Option<String>,

    /// Control-plane URL handing out presigned upload forms
    pub presign_url: Option<String>,

    /// Per-request HTTP timeout
    pub timeout_secs: u64,
}

impl Default for ShippingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            access_key_id: None,
            secret_access_key: None,
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            presign_url: None,
            timeout_secs: 30,
        }
    }
}

impl ShippingSettings {
    /// The static credential pair, when both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key.as_str(), secret.as_str()))
            }
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Keeps the secret out of debug output.
impl std::fmt::Debug for ShippingSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShippingSettings")
            .field("enabled", &self.enabled)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("presign_url", &self.presign_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}
