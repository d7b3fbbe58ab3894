//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TLVRPC_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tlvrpc_protocol::{TlvConfig, DEFAULT_HEADER_SIZE, DEFAULT_MAX_BODY_SIZE, MIN_HEADER_SIZE};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Frame limits.
    pub tlv: TlvSettings,
    /// Reactor topology.
    pub reactor: ReactorConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TLVRPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.tlv.apply_env_overrides();
        self.reactor.apply_env_overrides();
    }

    /// Checks limits that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tlv.validate()?;
        self.reactor.validate()?;
        if self.network.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "network.backlog must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Pending-connection backlog of the listening socket.
    pub backlog: u32,
    /// Maximum concurrent connections (advisory).
    pub max_connections: usize,
    /// Request timeout in milliseconds (advisory, not enforced by the reactor).
    pub request_timeout_ms: u64,
    /// Response timeout in milliseconds (advisory, not enforced by the reactor).
    pub response_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], tlvrpc_protocol::DEFAULT_PORT)),
            backlog: 1024,
            max_connections: 1000,
            request_timeout_ms: 1000,
            response_timeout_ms: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TLVRPC_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(backlog) = std::env::var("TLVRPC_BACKLOG") {
            if let Ok(n) = backlog.parse() {
                self.backlog = n;
            }
        }

        if let Ok(max) = std::env::var("TLVRPC_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(timeout) = std::env::var("TLVRPC_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("TLVRPC_RESPONSE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.response_timeout_ms = ms;
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Frame limits shared with clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlvSettings {
    /// Header size in bytes (at least 5).
    pub header_size_bytes: usize,
    /// Largest accepted body.
    pub max_body_size_bytes: u32,
}

impl Default for TlvSettings {
    fn default() -> Self {
        Self {
            header_size_bytes: DEFAULT_HEADER_SIZE,
            max_body_size_bytes: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl TlvSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("TLVRPC_HEADER_SIZE") {
            if let Ok(n) = size.parse() {
                self.header_size_bytes = n;
            }
        }

        if let Ok(size) = std::env::var("TLVRPC_MAX_BODY_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_body_size_bytes = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.header_size_bytes < MIN_HEADER_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "tlv.header_size_bytes must be at least {}, got {}",
                MIN_HEADER_SIZE, self.header_size_bytes
            )));
        }
        Ok(())
    }

    /// Returns the codec view of these settings.
    pub fn tlv_config(&self) -> TlvConfig {
        TlvConfig {
            header_size_bytes: self.header_size_bytes,
            max_body_size_bytes: self.max_body_size_bytes,
        }
    }
}

/// Reactor topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactorMode {
    /// One thread owns the listener and every connection.
    #[default]
    Single,
    /// An acceptor thread shards connections over worker reactors.
    Multi,
}

/// Reactor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Server topology.
    pub mode: ReactorMode,
    /// Worker reactors in multi mode.
    pub workers: usize,
    /// Readiness events drained per poll.
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            mode: ReactorMode::Single,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            events_capacity: 1024,
        }
    }
}

impl ReactorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("TLVRPC_REACTOR_MODE") {
            self.mode = match mode.to_lowercase().as_str() {
                "multi" | "multi_reactor" => ReactorMode::Multi,
                _ => ReactorMode::Single,
            };
        }

        if let Ok(workers) = std::env::var("TLVRPC_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.workers = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationError(
                "reactor.workers must be greater than zero".to_string(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "reactor.events_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors loading or validating a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("invalid YAML in config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
