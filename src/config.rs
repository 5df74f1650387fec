//! Configuration file parsing
//!
//! Parses TOML configuration files for a store node. Every section is
//! optional; an empty file yields the defaults.

use crate::network::codec::{DEFAULT_MAX_MESSAGE_SIZE, MAX_FRAME_LEN};
use crate::network::transport::DEFAULT_QUEUE_CAPACITY;
use crate::storage::path::{is_valid_segment_len, DEFAULT_SEGMENT_LEN};
use crate::storage::store::DEFAULT_ROOT;
use crate::storage::HashAlgorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub transport: TransportSettings,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Nodes to dial on startup
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            bootstrap_nodes: Vec::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Path strategy
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathStrategy {
    #[default]
    Sha256,
    Blake3,
}

impl From<PathStrategy> for HashAlgorithm {
    fn from(strategy: PathStrategy) -> Self {
        match strategy {
            PathStrategy::Sha256 => HashAlgorithm::Sha256,
            PathStrategy::Blake3 => HashAlgorithm::Blake3,
        }
    }
}

/// Object store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Store root directory
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub path_strategy: PathStrategy,

    /// Hex characters per directory level
    #[serde(default = "default_segment_len")]
    pub segment_len: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            path_strategy: PathStrategy::default(),
            segment_len: default_segment_len(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_segment_len() -> usize {
    DEFAULT_SEGMENT_LEN
}

/// Transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    /// Delivery queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Largest accepted command record in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Seconds a stream body may wait for its consumer
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_message_size: default_max_message_size(),
            stream_timeout_secs: default_stream_timeout_secs(),
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_stream_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("server.listen_addr is empty".to_string()));
        }

        if let Some(node) = self.server.bootstrap_nodes.iter().find(|n| n.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "empty bootstrap node address: {:?}",
                node
            )));
        }

        if self.store.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("store.root is empty".to_string()));
        }

        if !is_valid_segment_len(self.store.segment_len) {
            return Err(ConfigError::Invalid(format!(
                "store.segment_len must divide 64, got {}",
                self.store.segment_len
            )));
        }

        if self.transport.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "transport.queue_capacity must be positive".to_string(),
            ));
        }

        if self.transport.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_message_size must be positive".to_string(),
            ));
        }

        if self.transport.max_message_size > MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "transport.max_message_size must be at most {}",
                MAX_FRAME_LEN
            )));
        }

        Ok(())
    }
}
