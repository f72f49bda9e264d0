//! Settings sections.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub relay: RelayBehaviorSettings,
    pub capture: CaptureSettings,
    pub audit: AuditSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeat_timeout_ms ({}) is shorter than heartbeat_interval_ms ({})",
                self.server.heartbeat_timeout_ms, self.server.heartbeat_interval_ms
            )));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.max_send_queue must be positive".into(),
            ));
        }
        if self.capture.max_buffered_records == 0 {
            return Err(SettingsError::InvalidValue(
                "capture.max_buffered_records must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port. Zero binds an ephemeral port.
    pub port: u16,
    /// Outbound frames buffered per connection before it counts as stalled.
    pub max_send_queue: usize,
    /// Interval between server pings.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is considered lost.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_send_queue: 1024,
            heartbeat_interval_ms: 25_000,
            heartbeat_timeout_ms: 30_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Session relay behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayBehaviorSettings {
    /// Delay between unsubscribing a bumped connection and closing it.
    pub bump_grace_ms: u64,
    /// Added to non-asset client and entity ids during playback.
    pub replay_id_offset: i64,
}

impl Default for RelayBehaviorSettings {
    fn default() -> Self {
        Self {
            bump_grace_ms: 500,
            replay_id_offset: 90_000,
        }
    }
}

impl RelayBehaviorSettings {
    pub fn bump_grace(&self) -> Duration {
        Duration::from_millis(self.bump_grace_ms)
    }
}

/// On-disk capture encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// JSON lines `{seq, event, data}` in one `data` file.
    #[default]
    Records,
    /// Fixed-width little-endian `pos` and `int` streams.
    Binary,
}

impl CaptureFormat {
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "records" => Some(Self::Records),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Root directory for captures.
    pub path: PathBuf,
    pub format: CaptureFormat,
    /// Period of the background flush of recording buffers.
    pub flush_interval_ms: u64,
    /// Buffer length that triggers an immediate flush.
    pub max_buffered_records: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./captures"),
            format: CaptureFormat::Records,
            flush_interval_ms: 5_000,
            max_buffered_records: 10_000,
        }
    }
}

impl CaptureSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Relational audit log of connection and capture events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    pub db_path: PathBuf,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: PathBuf::from("./komodo-audit.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
