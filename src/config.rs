use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TCP port of the Arcam IP control interface
pub const DEFAULT_PORT: u16 = 50000;

/// Connection settings for a receiver
///
/// Durations are stored in milliseconds so the structure reads naturally
/// from JSON. Every field except `host` has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout for a single TCP connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline used by `Session::send`
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// First reconnection delay, doubled after each failure
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Upper bound for the reconnection delay
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Connect attempts made by `Session::open` before giving up
    #[serde(default = "default_initial_attempts")]
    pub initial_attempts: u32,

    /// Broadcasts buffered per subscriber before the oldest are dropped
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    3000
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    16_000
}

fn default_initial_attempts() -> u32 {
    3
}

fn default_broadcast_capacity() -> usize {
    64
}

impl ConnectionConfig {
    /// Create a configuration for `host` with default settings
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            initial_attempts: default_initial_attempts(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }

    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reconnection backoff range
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_ms = base.as_millis() as u64;
        self.reconnect_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_initial_attempts(mut self, attempts: u32) -> Self {
        self.initial_attempts = attempts;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// `host:port` as used for logging and connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
