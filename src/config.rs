//! Configuration module for chatrelay.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::chat::validate_username;
use crate::{RelayError, Result};

/// Relay server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of live connections (the capacity).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Below this many connections the shutdown countdown is armed.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    /// Length of the shutdown countdown in seconds.
    #[serde(default = "default_shutdown_countdown")]
    pub shutdown_countdown_secs: u64,
    /// Time allowed for a new connection to send its username.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Frames buffered per connection before broadcasts to it are dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    2
}

fn default_shutdown_countdown() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_outbound_queue() -> usize {
    64
}

impl ServerConfig {
    /// Shutdown countdown as a [`Duration`].
    pub fn shutdown_countdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_countdown_secs)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            shutdown_countdown_secs: default_shutdown_countdown(),
            handshake_timeout_secs: default_handshake_timeout(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Per-frame size limits, shared by server and client.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitsConfig {
    /// Maximum size of the handshake (username) frame in bytes.
    #[serde(default = "default_max_handshake_bytes")]
    pub max_handshake_bytes: usize,
    /// Maximum size of a message frame in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_max_handshake_bytes() -> usize {
    64
}

fn default_max_frame_bytes() -> usize {
    16 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_handshake_bytes: default_max_handshake_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Local session configuration (who we are and where to connect).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Local username.
    #[serde(default = "default_username")]
    pub username: String,
    /// Whether this process hosts the relay.
    #[serde(default = "default_is_host")]
    pub host: bool,
    /// Relay address to connect to when not hosting.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
}

fn default_username() -> String {
    "Host".to_string()
}

fn default_is_host() -> bool {
    true
}

fn default_server_addr() -> String {
    "127.0.0.1:5050".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            host: default_is_host(),
            server_addr: default_server_addr(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/chatrelay.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Relay server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Frame size limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Local session configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(RelayError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `CHATRELAY_USERNAME`: Override the local username
    /// - `CHATRELAY_SERVER_ADDR`: Override the relay address to join
    pub fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var("CHATRELAY_USERNAME") {
            if !username.is_empty() {
                self.session.username = username;
            }
        }
        if let Ok(addr) = std::env::var("CHATRELAY_SERVER_ADDR") {
            if !addr.is_empty() {
                self.session.server_addr = addr;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(RelayError::Config(
                "server.max_connections must be at least 1".to_string(),
            ));
        }
        if self.server.min_connections > self.server.max_connections {
            return Err(RelayError::Config(format!(
                "server.min_connections ({}) exceeds server.max_connections ({})",
                self.server.min_connections, self.server.max_connections
            )));
        }
        if self.server.outbound_queue == 0 {
            return Err(RelayError::Config(
                "server.outbound_queue must be at least 1".to_string(),
            ));
        }
        if self.limits.max_handshake_bytes == 0 || self.limits.max_frame_bytes == 0 {
            return Err(RelayError::Config(
                "frame size limits must be greater than zero".to_string(),
            ));
        }
        validate_username(&self.session.username, self.limits.max_handshake_bytes)
            .map_err(|e| RelayError::Config(format!("session.username: {e}")))?;
        Ok(())
    }
}
