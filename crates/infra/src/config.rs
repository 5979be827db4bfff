//! Engine configuration, loaded once at startup from TOML.
//!
//! ```toml
//! [scheduler]
//! push_interval_secs = 30
//!
//! [queue]
//! max_attempts = 5
//!
//! [[connections]]
//! id = "0190c1d2-..."
//! hotel_id = "0190c1d2-..."
//! channel_type = "channel_manager"
//! endpoint = "https://cm.example.com"
//! api_key = "..."
//! property_code = "H-42"
//!
//! [[connections.room_mappings]]
//! room_type_id = "0190c1d2-..."
//! room_code = "DBL"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use innsync_core::{ConnectionId, HotelId, RoomTypeId};
use innsync_observability::LoggingConfig;

use crate::channel::{BackoffTiers, ChannelType, PullMode};
use crate::queue::{BackoffStrategy, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Credential that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub push_interval_secs: u64,
    pub pull_interval_secs: u64,
    pub full_sync_interval_secs: u64,
    /// Days ahead covered by a periodic full sync.
    pub full_sync_horizon_days: u32,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: 30,
            pull_interval_secs: 300,
            full_sync_interval_secs: 24 * 60 * 60,
            full_sync_horizon_days: 365,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempt ceiling before a task fails permanently.
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub strategy: BackoffStrategy,
    /// Tasks claimed per push cycle.
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 15 * 60,
            strategy: BackoffStrategy::Exponential,
            batch_size: 20,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            strategy: self.strategy,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomMapping {
    pub room_type_id: RoomTypeId,
    /// The channel's code for the room.
    pub room_code: String,
}

fn default_true() -> bool {
    true
}

fn default_pull_modes() -> Vec<PullMode> {
    PullMode::ALL.to_vec()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub id: ConnectionId,
    pub hotel_id: HotelId,
    pub channel_type: ChannelType,
    pub endpoint: String,
    pub api_key: Secret,
    pub property_code: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pull_modes")]
    pub pull_modes: Vec<PullMode>,
    #[serde(default)]
    pub room_mappings: Vec<RoomMapping>,
    /// Overrides `[client] timeout_secs` for this connection.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ConnectionConfig {
    pub fn room_code_for(&self, room_type_id: RoomTypeId) -> Option<&str> {
        self.room_mappings
            .iter()
            .find(|m| m.room_type_id == room_type_id)
            .map(|m| m.room_code.as_str())
    }

    pub fn room_type_for(&self, room_code: &str) -> Option<RoomTypeId> {
        self.room_mappings
            .iter()
            .find(|m| m.room_code == room_code)
            .map(|m| m.room_type_id)
    }

    pub fn maps(&self, hotel_id: HotelId, room_type_id: RoomTypeId) -> bool {
        self.hotel_id == hotel_id && self.room_code_for(room_type_id).is_some()
    }

    pub fn call_timeout(&self, client: &ClientConfig) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(client.timeout_secs))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub backoff: BackoffTiers,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    pub connections: Vec<ConnectionConfig>,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn enabled_connections(&self) -> impl Iterator<Item = &ConnectionConfig> {
        self.connections.iter().filter(|c| c.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".into()));
        }
        if self.client.timeout_secs == 0 {
            return Err(ConfigError::Invalid("client.timeout_secs must be at least 1".into()));
        }
        let s = &self.scheduler;
        if s.push_interval_secs == 0 || s.pull_interval_secs == 0 || s.full_sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("scheduler intervals must be at least 1s".into()));
        }
        if s.full_sync_horizon_days == 0 {
            return Err(ConfigError::Invalid("scheduler.full_sync_horizon_days must be at least 1".into()));
        }
        self.backoff
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut ids = HashSet::new();
        for conn in &self.connections {
            if !ids.insert(conn.id) {
                return Err(ConfigError::Invalid(format!("duplicate connection id {}", conn.id)));
            }
            if conn.room_mappings.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "connection {} has no room mappings",
                    conn.id
                )));
            }
            let mut codes = HashSet::new();
            let mut rooms = HashSet::new();
            for mapping in &conn.room_mappings {
                if !codes.insert(mapping.room_code.as_str()) || !rooms.insert(mapping.room_type_id) {
                    return Err(ConfigError::Invalid(format!(
                        "connection {} maps room code {} or room type {} twice",
                        conn.id, mapping.room_code, mapping.room_type_id
                    )));
                }
            }
            if conn.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "connection {} timeout_secs must be at least 1",
                    conn.id
                )));
            }
        }
        Ok(())
    }
}
