//! Session scheduler: one blocking worker thread per transfer.
//!
//! Each worker owns its session from start to finish, so no two threads
//! ever touch the same session. The worker takes the file lock before the
//! first packet and holds it until the session ends; a worker whose lock is
//! not yet available sleeps on the lock's condition variable.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context;

use crate::tftp::core::{Direction, FileGuard, LockRegistry, SessionConfig, TransferSession};

/// What the registry knows about a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub filename: String,
    pub direction: Direction,
    pub started: Instant,
}

/// A validated request handed over by the listener.
#[derive(Debug, Clone)]
pub struct Request {
    pub peer: SocketAddr,
    /// Normalized name, also the lock key.
    pub filename: String,
    pub path: PathBuf,
    pub direction: Direction,
}

type Registry = Arc<Mutex<HashMap<SocketAddr, SessionInfo>>>;

pub struct Scheduler {
    bind_ip: IpAddr,
    config: SessionConfig,
    max_sessions: usize,
    locks: Arc<LockRegistry>,
    sessions: Registry,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(bind_ip: IpAddr, config: SessionConfig, max_sessions: usize) -> Self {
        Self {
            bind_ip,
            config,
            max_sessions,
            locks: LockRegistry::new(),
            sessions: Arc::default(),
            workers: Vec::new(),
        }
    }

    /// Starts a session for `request` on a fresh local port.
    ///
    /// Returns the session's local address, or `None` when the request was
    /// dropped because the scheduler is full or the peer already has a
    /// session for this file (a retransmitted request).
    pub fn dispatch(&mut self, request: Request) -> anyhow::Result<Option<SocketAddr>> {
        self.reap();

        let (socket, local) = {
            let mut sessions = lock(&self.sessions);
            if sessions.len() >= self.max_sessions {
                log::warn!(
                    "Dropping request for '{}' from {}: {} sessions active",
                    request.filename,
                    request.peer,
                    sessions.len()
                );
                return Ok(None);
            }
            if sessions
                .values()
                .any(|s| s.peer == request.peer && s.filename == request.filename)
            {
                log::debug!(
                    "Ignoring repeated request for '{}' from {}",
                    request.filename,
                    request.peer
                );
                return Ok(None);
            }

            let socket = UdpSocket::bind((self.bind_ip, 0)).context("Failed to bind transfer socket")?;
            let local = socket.local_addr()?;
            sessions.insert(
                local,
                SessionInfo {
                    peer: request.peer,
                    filename: request.filename.clone(),
                    direction: request.direction,
                    started: Instant::now(),
                },
            );
            (socket, local)
        };

        let registration = Registration {
            sessions: Arc::clone(&self.sessions),
            local,
        };
        let locks = Arc::clone(&self.locks);
        let config = self.config;

        let spawned = thread::Builder::new()
            .name(format!("tftp-{}", local.port()))
            .spawn(move || run_session(socket, request, config, locks, registration));

        match spawned {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(Some(local))
            }
            // The closure, and with it the registration, is dropped on failure.
            Err(e) => Err(e).context("Failed to spawn transfer worker"),
        }
    }

    /// Number of sessions registered, including those waiting for a lock.
    pub fn active(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn sessions(&self) -> Vec<(SocketAddr, SessionInfo)> {
        lock(&self.sessions)
            .iter()
            .map(|(local, info)| (*local, info.clone()))
            .collect()
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Joins workers that have finished.
    pub fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|w| w.is_finished());
        self.workers = running;
        for worker in finished {
            join(worker);
        }
    }

    /// Waits for every worker to finish.
    pub fn join_all(&mut self) {
        for worker in self.workers.drain(..) {
            join(worker);
        }
    }
}

fn run_session(
    socket: UdpSocket,
    request: Request,
    config: SessionConfig,
    locks: Arc<LockRegistry>,
    _registration: Registration,
) {
    let Request {
        peer,
        filename,
        path,
        direction,
    } = request;

    let _guard = match direction {
        Direction::Send => FileGuard::Read(locks.acquire_read(&filename)),
        Direction::Receive => FileGuard::Write(locks.acquire_write(&filename)),
    };

    let session = match direction {
        Direction::Send => TransferSession::serve_read(socket, peer, &filename, path, config),
        Direction::Receive => TransferSession::serve_write(socket, peer, &filename, path, config),
    };

    match session.run() {
        Ok(report) => log::info!(
            "{} '{}' with {} finished: {} blocks, {} bytes",
            if direction == Direction::Send { "Download" } else { "Upload" },
            filename,
            peer,
            report.blocks,
            report.bytes
        ),
        Err(e) => log::warn!("Transfer of '{}' with {} failed: {}", filename, peer, e),
    }
}

/// Removes the session from the registry when the worker ends, however it ends.
struct Registration {
    sessions: Registry,
    local: SocketAddr,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(info) = lock(&self.sessions).remove(&self.local) {
            log::debug!(
                "Session {} for '{}' with {} ended after {:.1?}",
                self.local,
                info.filename,
                info.peer,
                info.started.elapsed()
            );
        }
    }
}

fn lock(sessions: &Registry) -> MutexGuard<'_, HashMap<SocketAddr, SessionInfo>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join(worker: JoinHandle<()>) {
    let name = worker.thread().name().unwrap_or("tftp").to_string();
    if worker.join().is_err() {
        log::error!("Transfer worker {} panicked", name);
    }
}
