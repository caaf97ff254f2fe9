use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::tftp::core::SessionConfig;
use crate::tftp::core::session::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};

pub const DEFAULT_PORT: u16 = 69;
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// TFTP server configuration
///
/// Every field is optional so the same struct can be read from the
/// `[tftpd]` section of the configuration file and then completed from the
/// command line with [`Config::merge_cli`].
///
/// # Example
///
/// ```rust
/// use tftpkit::tftp::server::Config;
/// use std::path::PathBuf;
///
/// let config = Config::default().merge_cli(
///     "127.0.0.1".to_string(),
///     6969,
///     PathBuf::from("/tmp/tftp"),
///     false,
///     None,
/// );
/// assert_eq!(config.port, Some(6969));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// IP address to listen on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Well-known port for incoming requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Storage root; every transferred file lives below it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Reject all write requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Allow WRQ to replace an existing file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
    /// Retransmission timeout
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    /// Consecutive timeouts before a session is abandoned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Concurrent sessions before new requests are dropped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
}

impl Config {
    /// Configuration with every field filled in, used by `genconfig`.
    pub fn with_defaults() -> Self {
        Self {
            ip: Some("0.0.0.0".to_string()),
            port: Some(DEFAULT_PORT),
            directory: Some(PathBuf::from(".")),
            read_only: Some(false),
            overwrite: Some(true),
            timeout: Some(DEFAULT_TIMEOUT),
            max_retries: Some(DEFAULT_MAX_RETRIES),
            max_sessions: Some(DEFAULT_MAX_SESSIONS),
        }
    }

    /// Fills the gaps left by the configuration file with CLI values.
    pub fn merge_cli(
        mut self,
        cli_ip: String,
        cli_port: u16,
        cli_directory: PathBuf,
        cli_read_only: bool,
        cli_max_sessions: Option<usize>,
    ) -> Self {
        if self.ip.is_none() {
            self.ip = Some(cli_ip);
        }
        if self.port.is_none() {
            self.port = Some(cli_port);
        }
        if self.directory.is_none() {
            self.directory = Some(cli_directory);
        }
        // Read-only is sticky: either source can turn it on.
        self.read_only = Some(self.read_only.unwrap_or(false) || cli_read_only);
        if self.max_sessions.is_none() {
            self.max_sessions = cli_max_sessions;
        }
        self
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = match self.ip.as_deref() {
            Some(ip) => ip
                .parse()
                .with_context(|| format!("Invalid IP address '{}'", ip))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_PORT)))
    }

    pub fn root(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }

    pub fn allows_overwrite(&self) -> bool {
        self.overwrite.unwrap_or(true)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
        }
    }

    pub fn session_limit(&self) -> usize {
        self.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS).max(1)
    }
}
