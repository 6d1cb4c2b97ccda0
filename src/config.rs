//! Connection configuration
//!
//! Provides the client's endpoint and timeout settings with:
//! - Serde support for loading from files/env
//! - Builder pattern for customization
//! - Sensible defaults matching the engine's defaults

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default engine host
pub const DEFAULT_HOST: &str = "localhost";

/// Default engine port
pub const DEFAULT_PORT: u32 = 69420;

/// Default connection timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Environment variable overriding the engine host
const HOST_ENV: &str = "PROLEAK_HOST";

/// Environment variable overriding the engine port
const PORT_ENV: &str = "PROLEAK_PORT";

/// Client connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine host to connect to
    pub host: String,

    /// Engine port to connect to
    pub port: u32,

    /// Bound on how long a connection attempt may take (seconds)
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the environment, falling back to defaults
    ///
    /// `PROLEAK_HOST` and `PROLEAK_PORT` override the endpoint; an unset or
    /// unparsable port leaves the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(HOST_ENV) {
            config.host = host;
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        config
    }

    /// Builder method for the engine host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Builder method for the engine port
    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    /// Builder method for the connection timeout
    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// The `host:port` address string used for connecting
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The connection timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
