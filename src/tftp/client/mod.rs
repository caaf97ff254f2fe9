//! TFTP client implementation
//!
//! This module provides TFTP client functionality:
//! - File download (GET/RRQ)
//! - File upload (PUT/WRQ)
//!
//! Transfers always use octet mode and 512-byte blocks.
//!
//! # Usage Examples
//!
//! ## Download file
//!
//! ```rust,no_run
//! use tftpkit::tftp::client::Client;
//! use tftpkit::tftp::client::config::ClientConfig;
//! use std::path::Path;
//!
//! let config = ClientConfig::new("192.168.1.100".to_string(), 69);
//! let client = Client::new(config).unwrap();
//! client.get("remote.txt", Path::new("local.txt")).unwrap();
//! ```
//!
//! ## Upload file
//!
//! ```rust,no_run
//! use tftpkit::tftp::client::Client;
//! use tftpkit::tftp::client::config::ClientConfig;
//! use std::path::Path;
//!
//! let config = ClientConfig::new("192.168.1.100".to_string(), 69);
//! let client = Client::new(config).unwrap();
//! client.put(Path::new("local.txt"), "remote.txt").unwrap();
//! ```
//!
//! # Command Line Usage
//!
//! ```bash
//! # Download file
//! tftpkit tftpc get 192.168.1.100 remote.txt [local.txt]
//!
//! # Upload file
//! tftpkit tftpc put 192.168.1.100 local.txt [remote.txt]
//! ```

mod client_impl;
pub mod config;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

pub use client_impl::Client;

#[derive(Subcommand)]
pub enum TftpcAction {
    /// Download a file from TFTP server (RRQ)
    Get {
        /// Server IP address or hostname
        server: String,

        /// Remote file name on server
        remote_file: String,

        /// Local file path (defaults to remote file name)
        #[arg(value_name = "LOCAL_FILE")]
        local_file: Option<PathBuf>,

        /// Server port
        #[arg(short, long, default_value = "69")]
        port: u16,

        /// Timeout in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// Upload a file to TFTP server (WRQ)
    Put {
        /// Server IP address or hostname
        server: String,

        /// Local file path to upload
        local_file: PathBuf,

        /// Remote file name on server (defaults to local file name)
        #[arg(value_name = "REMOTE_FILE")]
        remote_file: Option<String>,

        /// Server port
        #[arg(short, long, default_value = "69")]
        port: u16,

        /// Timeout in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

/// Run TFTP client command with configuration
pub fn run_with_config(action: TftpcAction, config: Option<&config::TftpcConfigFile>) -> Result<()> {
    match action {
        TftpcAction::Get {
            server,
            remote_file,
            local_file,
            port,
            timeout,
        } => {
            let client_config = config.and_then(|c| c.get.clone()).unwrap_or_default();
            let cfg = client_config.merge_cli(server, port, timeout);

            let local_path = local_file.unwrap_or_else(|| {
                // Only the last segment of the remote name lands locally.
                PathBuf::from(remote_file.rsplit('/').next().unwrap_or(&remote_file))
            });

            let client = Client::new(cfg)?;
            log::info!("Downloading {} from {}", remote_file, client.server_addr());
            log::info!("Saving to: {}", local_path.display());

            client.get(&remote_file, &local_path)?;

            log::info!("Download completed successfully");
        }

        TftpcAction::Put {
            server,
            local_file,
            remote_file,
            port,
            timeout,
        } => {
            let client_config = config.and_then(|c| c.put.clone()).unwrap_or_default();
            let cfg = client_config.merge_cli(server, port, timeout);

            if !local_file.is_file() {
                log::error!("Local file does not exist: {}", local_file.display());
                return Err(anyhow::anyhow!("Local file does not exist"));
            }

            let remote_name = match remote_file {
                Some(name) => name,
                None => local_file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow::anyhow!("Cannot derive a remote name from {}", local_file.display()))?
                    .to_string(),
            };

            let client = Client::new(cfg)?;
            log::info!("Uploading {} to {}", local_file.display(), client.server_addr());
            log::info!("Remote file: {}", remote_name);

            client.put(&local_file, &remote_name)?;

            log::info!("Upload completed successfully");
        }
    }
    Ok(())
}
