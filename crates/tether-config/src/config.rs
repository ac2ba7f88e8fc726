//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Networking settings.
    pub network: NetworkConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Networking configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server address for clients to connect to.
    pub server_address: String,
    /// Port the server listens on.
    pub server_port: u16,
    /// Use the datagram (UDP) transport instead of the stream (TCP) one.
    pub use_datagrams: bool,
    /// Peer liveness timeout for the datagram transport, in milliseconds.
    pub timeout_ms: u64,
    /// Maximum messages dispatched per update tick (0 = unlimited).
    pub update_batch: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (e.g. "info", "debug", "warn,tether_net=trace").
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 60000,
            use_datagrams: false,
            timeout_ms: 5_000,
            update_batch: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(|source| {
                ConfigError::Io {
                    path: config_path.clone(),
                    source,
                }
            })?;
            let config: Config = ron::from_str(&contents).map_err(|source| {
                ConfigError::Malformed {
                    path: config_path.clone(),
                    source,
                }
            })?;
            tracing::info!("loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            tracing::info!("created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Io {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        let config_path = config_dir.join("config.ron");
        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }
}
