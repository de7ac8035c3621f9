//! Configuration
//!
//! TOML-based configuration with `[log]`, `[server]`, `[auth]` and
//! `[authz]` sections. Every field has a default so a missing file or
//! an empty table yields a runnable broker.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub authz: AuthzConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
    /// Outbound packet queue depth per connection
    pub outbound_queue: usize,
    /// Seconds a new socket may sit idle before its CONNECT
    pub connect_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().expect("valid default bind"),
            max_packet_size: 1024 * 1024,
            outbound_queue: 1024,
            connect_timeout: 30,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept connections without credentials
    pub allow_anonymous: bool,
    /// Username/password entries
    pub users: Vec<AuthUser>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// One configured user
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub username: String,
    pub password: String,
}

/// Authorization shortcut: restrict all traffic to one topic and
/// optionally one publish QoS
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    pub allowed_topic: Option<String>,
    pub allowed_qos: Option<u8>,
}
