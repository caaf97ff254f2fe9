//! TFTP server implementation
//!
//! This module provides complete TFTP server functionality:
//! - `server`: Listener on the well-known port, validates requests
//! - `scheduler`: Runs each transfer on its own port and thread
//! - `config`: Server configuration

pub mod config;
mod scheduler;
mod server_impl;

use anyhow::Result;
use std::path::PathBuf;

// Public server types
pub use config::Config;
pub use scheduler::{Request, Scheduler, SessionInfo};
pub use server_impl::Server;

/// Run the TFTP server with CLI arguments and optional configuration
pub fn run_with_config(
    ip: String,
    port: u16,
    path: PathBuf,
    read_only: bool,
    max_sessions: Option<usize>,
    config: Option<Config>,
) -> Result<()> {
    let server_config = config.unwrap_or_default();
    let config = server_config.merge_cli(ip, port, path, read_only, max_sessions);

    let addr = config.bind_addr()?;
    let session = config.session_config();

    log::info!("Starting TFTP server on {}", addr);
    log::info!("Serving directory: {}", config.root().display());
    log::info!("Read-only mode: {}", config.is_read_only());
    log::info!("Overwrite existing files: {}", config.allows_overwrite());
    log::info!(
        "Timeout {:?}, {} retries, at most {} sessions",
        session.timeout,
        session.max_retries,
        config.session_limit()
    );

    let mut server = Server::new(&config)?;

    log::info!("TFTP server listening, press Ctrl+C to stop");
    server.listen();

    Ok(())
}
