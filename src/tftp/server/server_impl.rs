use std::net::{SocketAddr, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;

use super::config::Config;
use super::scheduler::{Request, Scheduler};
use crate::tftp::core::{Direction, ErrorCode, Packet, Received, Socket};

/// How often the listener wakes up to reap workers and check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// TFTP server listener
///
/// Owns the well-known socket. Requests that pass validation are handed to
/// the [`Scheduler`], which answers from a fresh port so the listener never
/// carries transfer traffic.
pub struct Server {
    socket: UdpSocket,
    root: PathBuf,
    read_only: bool,
    overwrite: bool,
    scheduler: Scheduler,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: &Config) -> anyhow::Result<Server> {
        let addr = config.bind_addr()?;
        let root = config.root();
        if !root.is_dir() {
            anyhow::bail!("Directory does not exist: {}", root.display());
        }

        let socket = UdpSocket::bind(addr).with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Server {
            socket,
            root,
            read_only: config.is_read_only(),
            overwrite: config.allows_overwrite(),
            scheduler: Scheduler::new(addr.ip(), config.session_config(), config.session_limit()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Flag that stops [`Server::listen`] once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn active_sessions(&self) -> usize {
        self.scheduler.active()
    }

    /// Serves requests until the shutdown flag is raised, then waits for the
    /// running transfers to finish.
    pub fn listen(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match Socket::recv_from(&self.socket, POLL_INTERVAL) {
                Ok(Received::Datagram(bytes, from)) => self.handle_datagram(&bytes, from),
                Ok(Received::TimedOut) => self.scheduler.reap(),
                Err(e) => log::error!("Receive failed: {:#}", e),
            }
        }

        log::info!("Shutting down, waiting for {} session(s)", self.scheduler.active());
        self.scheduler.join_all();
    }

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let packet = match Packet::deserialize(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Bad request from {}: {}", from, e);
                self.send_error(e.error_code(), from);
                return;
            }
        };

        // The codec has already refused every mode other than octet.
        let (filename, direction) = match packet {
            Packet::Rrq { filename, .. } => (filename, Direction::Send),
            Packet::Wrq { filename, .. } => (filename, Direction::Receive),
            other => {
                log::debug!("Discarding {} from {} on the listening port", other, from);
                return;
            }
        };

        log::info!(
            "{} '{}' from {}",
            if direction == Direction::Send { "RRQ" } else { "WRQ" },
            filename,
            from
        );

        if let Err(code) = self.handle_request(&filename, direction, from) {
            log::warn!("Rejected request for '{}' from {}: {}", filename, from, code);
            self.send_error(code, from);
        }
    }

    fn handle_request(&mut self, filename: &str, direction: Direction, from: SocketAddr) -> Result<(), ErrorCode> {
        let relative = validate_filename(filename).ok_or(ErrorCode::AccessViolation)?;
        let path = self.root.join(&relative);

        if direction == Direction::Receive {
            if self.read_only {
                return Err(ErrorCode::AccessViolation);
            }
            if !self.overwrite && path.exists() {
                return Err(ErrorCode::FileAlreadyExists);
            }
        }

        let request = Request {
            peer: from,
            filename: lock_key(&relative),
            path,
            direction,
        };
        match self.scheduler.dispatch(request) {
            Ok(Some(local)) => {
                log::debug!("Session for {} on {}", from, local);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                log::error!("Failed to start session for {}: {:#}", from, e);
                Err(ErrorCode::NotDefined)
            }
        }
    }

    fn send_error(&self, code: ErrorCode, to: SocketAddr) {
        if let Err(e) = Socket::send_to(&self.socket, &Packet::error(code), to) {
            log::warn!("Failed to send error to {}: {:#}", to, e);
        }
    }
}

/// Turns a requested name into a path relative to the storage root.
///
/// Returns `None` for names that could reach outside the root: absolute
/// paths, drive prefixes and any `..` segment.
fn validate_filename(filename: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

/// `a.txt` and `./a.txt` name the same file and must share a lock.
fn lock_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
