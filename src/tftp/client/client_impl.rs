use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::Path;

use anyhow::Context;

use super::config::ClientConfig;
use crate::tftp::core::{SessionConfig, TransferReport, TransferSession};

/// TFTP client
///
/// Supports file upload (PUT) and download (GET) operations. Each call runs
/// one transfer on a fresh local port.
pub struct Client {
    server: SocketAddr,
    session: SessionConfig,
}

impl Client {
    /// Create a new TFTP client
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let host = config
            .server
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Server address not specified"))?;
        let port = config.port.unwrap_or(69);
        let server = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid server address '{}'", host))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Server address '{}' did not resolve", host))?;

        Ok(Self {
            server,
            session: config.session_config(),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Download a file from the server (RRQ - Read Request)
    ///
    /// On failure any partially written local file is removed.
    pub fn get(&self, remote_file: &str, local_file: &Path) -> anyhow::Result<TransferReport> {
        log::info!("Downloading {} to {}", remote_file, local_file.display());

        let socket = self.bind()?;
        let report = TransferSession::download(socket, self.server, remote_file, local_file, self.session)
            .run()
            .with_context(|| format!("Download of '{}' failed", remote_file))?;

        log::info!("Received {} bytes in {} blocks", report.bytes, report.blocks);
        Ok(report)
    }

    /// Upload a file to the server (WRQ - Write Request)
    pub fn put(&self, local_file: &Path, remote_file: &str) -> anyhow::Result<TransferReport> {
        log::info!("Uploading {} as {}", local_file.display(), remote_file);

        let socket = self.bind()?;
        let report = TransferSession::upload(socket, self.server, local_file, remote_file, self.session)
            .run()
            .with_context(|| format!("Upload of '{}' failed", local_file.display()))?;

        log::info!("Sent {} bytes in {} blocks", report.bytes, report.blocks);
        Ok(report)
    }

    fn bind(&self) -> anyhow::Result<UdpSocket> {
        let local = if self.server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).context("Failed to bind local socket")?;
        log::debug!("Local TID {}", socket.local_addr()?);
        Ok(socket)
    }
}
