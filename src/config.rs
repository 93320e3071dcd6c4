use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::db::DEFAULT_DEVICE_LEASE_SECS;
use crate::sync::RetryPolicy;

/// Sync server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Directory holding the database and token file unless overridden
    pub data_dir: PathBuf,
    /// Path to the SQLite database (default: `<data_dir>/marksync.db`)
    pub database_path: Option<PathBuf>,
    /// Path to the token file (default: `<data_dir>/tokens.yaml`)
    pub tokens_path: Option<PathBuf>,
    /// Identifies this process on the shared bus
    pub instance_id: String,
    pub auth_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Capacity of each per-user broadcast channel
    pub bus_capacity: usize,
    /// Events fetched per Delta Store query
    pub page_size: i64,
    /// Overlapping updates further behind than this are rejected outright
    pub max_cursor_lag: i64,
    /// How often the relay polls for events from other instances
    pub relay_poll_ms: u64,
    /// Devices unseen for this long are marked inactive
    pub inactive_after_days: i64,
    /// A connected device whose session stops renewing for this long counts
    /// as offline
    pub device_lease_secs: i64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("marksync"),
            database_path: None,
            tokens_path: None,
            instance_id: uuid::Uuid::new_v4().to_string(),
            auth_timeout_secs: 10,
            handshake_timeout_secs: 10,
            bus_capacity: 1024,
            page_size: 500,
            max_cursor_lag: 10_000,
            relay_poll_ms: 250,
            inactive_after_days: 90,
            device_lease_secs: DEFAULT_DEVICE_LEASE_SECS,
            retry: RetryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        if let Ok(port) = std::env::var("MARKSYNC_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("MARKSYNC_PORT", port))?;
        }
        if let Ok(dir) = std::env::var("MARKSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(db) = std::env::var("MARKSYNC_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(db));
        }
        if let Ok(tokens) = std::env::var("MARKSYNC_TOKENS") {
            config.tokens_path = Some(PathBuf::from(tokens));
        }
        if let Ok(instance) = std::env::var("MARKSYNC_INSTANCE_ID") {
            config.instance_id = instance;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue("instance_id", self.instance_id.clone()));
        }
        if self.page_size <= 0 {
            return Err(ConfigError::InvalidValue("page_size", self.page_size.to_string()));
        }
        if self.device_lease_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "device_lease_secs",
                self.device_lease_secs.to_string(),
            ));
        }
        if self.bus_capacity == 0 {
            return Err(ConfigError::InvalidValue("bus_capacity", "0".into()));
        }
        Ok(())
    }

    /// Default config file path: ~/.config/marksync/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marksync")
            .join("config.yaml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("marksync.db"))
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.tokens_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tokens.yaml"))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn device_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.device_lease_secs)
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, serde_yaml::Error),
    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(&'static str, String),
}
