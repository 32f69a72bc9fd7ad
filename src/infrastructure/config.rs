//! Configuration management
//!
//! Loads configuration from config.toml at startup.
//! Transport tuning, logging and the feed list all live here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ws::WebSocketConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// WebSocket transport settings shared by every feed
    #[serde(default)]
    pub transport: WebSocketConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Feeds opened by the engine
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// EnvFilter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write log files (console output is always on)
    #[serde(default = "default_true")]
    pub file: bool,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// How often transport metrics are logged
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Protocol spoken over a feed's WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FeedProtocol {
    #[serde(rename = "socketio")]
    SocketIo,
    #[serde(rename = "pusher")]
    Pusher,
    /// Raw text frames, no sub-protocol
    #[serde(rename = "websocket")]
    WebSocket,
}

/// One exchange feed
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    pub name: String,
    pub protocol: FeedProtocol,
    /// `http(s)://` base for socket.io, `ws(s)://` for the others
    pub url: String,

    /// socket.io endpoint (namespace), e.g. `/icbit`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Payloads sent right after open (socket.io json packets or raw text)
    #[serde(default)]
    pub subscribe: Vec<String>,

    /// Pusher channels to subscribe to
    #[serde(default)]
    pub channels: Vec<String>,

    /// WebSocket ping interval when the link is idle; none disables it
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            file: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stats_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from `CONFIG_PATH` or config.toml
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(config_path)
    }

    /// Load from an explicit path (missing file -> defaults)
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse TOML text
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) => None,
        }
    }
}
