use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tftp::core::SessionConfig;
use crate::tftp::core::session::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};

/// `[tftpc]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TftpcConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<ClientConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<ClientConfig>,
}

impl TftpcConfigFile {
    pub fn with_defaults() -> Self {
        Self {
            get: Some(ClientConfig::with_defaults()),
            put: Some(ClientConfig::with_defaults()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl ClientConfig {
    pub fn new(server: String, port: u16) -> Self {
        Self {
            server: Some(server),
            port: Some(port),
            timeout: Some(DEFAULT_TIMEOUT),
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }

    /// Everything but the server, which has no sensible default.
    fn with_defaults() -> Self {
        Self {
            server: None,
            port: Some(69),
            timeout: Some(DEFAULT_TIMEOUT),
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }

    pub fn merge_cli(mut self, cli_server: String, cli_port: u16, cli_timeout: u64) -> Self {
        // CLI args are used if config file doesn't specify them
        // (File > CLI)
        if self.server.is_none() {
            self.server = Some(cli_server);
        }
        if self.port.is_none() {
            self.port = Some(cli_port);
        }
        if self.timeout.is_none() {
            self.timeout = Some(Duration::from_secs(cli_timeout));
        }
        if self.max_retries.is_none() {
            self.max_retries = Some(DEFAULT_MAX_RETRIES);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
        }
    }
}
