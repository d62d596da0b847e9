use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::core::distributor::DistributionPolicy;
use crate::core::settings::AddressSettings;

pub const DEFAULT_CONFIG_PATH: &str = "relaymq.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    /// Cluster node id stamped on local bindings.
    pub node_id: u32,
    /// Key used for this server in the message id generator registry.
    pub server_id: String,
    pub persistence_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7676".to_string(),
            max_connections: 1024,
            node_id: 1,
            server_id: "relaymq-1".to_string(),
            persistence_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Buffered synchronous writes on the caller's thread.
    #[default]
    Sync,
    /// One writer thread per open file, completion callbacks, 512 byte blocks.
    Async,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JournalConfig {
    pub directory: PathBuf,
    pub bindings_directory: PathBuf,
    pub file_size: usize,
    pub min_files: usize,
    pub io_mode: IoMode,
    /// Maximum in-flight writes per file in async mode.
    pub max_io: usize,
    /// Size of pooled write buffers in async mode.
    pub buffer_size: usize,
    pub sync_transactional: bool,
    pub sync_non_transactional: bool,
    pub compact_min_files: usize,
    pub compact_percentage: u32,
    pub id_batch_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/journal"),
            bindings_directory: PathBuf::from("data/bindings"),
            file_size: 10 * 1024 * 1024,
            min_files: 2,
            io_mode: IoMode::Sync,
            max_io: 500,
            buffer_size: 128 * 1024,
            sync_transactional: true,
            sync_non_transactional: false,
            compact_min_files: 10,
            compact_percentage: 30,
            id_batch_size: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Consumer credit window in bytes, -1 disables consumer flow control.
    pub consumer_window_size: i64,
    /// Producer credit window in bytes.
    pub producer_window_size: i64,
    pub expiry_scan_period_ms: u64,
    pub distribution: DistributionPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            consumer_window_size: 1024 * 1024,
            producer_window_size: 64 * 1024,
            expiry_scan_period_ms: 30_000,
            distribution: DistributionPolicy::RoundRobin,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub journal: JournalConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
    /// Settings keyed by address pattern (wildcards allowed).
    pub address_settings: BTreeMap<String, AddressSettings>,
}

impl Config {
    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: built-in defaults, then the file (`path` or
    /// `RELAYMQ_CONFIG`), then environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("RELAYMQ_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let mut config = match effective_path {
            Some(p) => Self::from_file(p)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("RELAYMQ_BIND_ADDR") {
            self.server.bind_addr = v;
        }

        if let Ok(v) = env::var("RELAYMQ_JOURNAL_DIR") {
            self.journal.directory = PathBuf::from(v);
        }

        if let Ok(v) = env::var("RELAYMQ_BINDINGS_DIR") {
            self.journal.bindings_directory = PathBuf::from(v);
        }

        if let Ok(v) = env::var("RELAYMQ_PERSISTENCE") {
            self.server.persistence_enabled = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::Parse(format!(
                        "RELAYMQ_PERSISTENCE: unrecognised value {other:?}"
                    )))
                }
            };
        }

        if let Ok(v) = env::var("RELAYMQ_NODE_ID") {
            self.server.node_id = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("RELAYMQ_NODE_ID: {e}")))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.journal.file_size < 1024 {
            return Err(ConfigError::Invalid(format!(
                "journal.file_size must be at least 1024 bytes, got {}",
                self.journal.file_size
            )));
        }
        if self.journal.min_files < 2 {
            return Err(ConfigError::Invalid(
                "journal.min_files must be at least 2".to_string(),
            ));
        }
        if self.journal.max_io == 0 {
            return Err(ConfigError::Invalid("journal.max_io must be > 0".to_string()));
        }
        if self.delivery.producer_window_size <= 0 {
            return Err(ConfigError::Invalid(
                "delivery.producer_window_size must be > 0".to_string(),
            ));
        }
        if self.delivery.consumer_window_size == 0 || self.delivery.consumer_window_size < -1 {
            return Err(ConfigError::Invalid(
                "delivery.consumer_window_size must be > 0 or -1".to_string(),
            ));
        }
        for (pattern, settings) in &self.address_settings {
            if settings.max_delivery_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "address_settings.{pattern:?}.max_delivery_attempts must be > 0"
                )));
            }
        }
        Ok(())
    }
}

/// Reads, env-overrides and validates the configuration at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let mut config = Config::from_file(path)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}
