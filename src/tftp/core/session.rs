//! Stop-and-wait transfer session.
//!
//! One [`TransferSession`] carries a single file across a private UDP
//! endpoint. The same state machine serves both ends of the protocol: the
//! server answering an RRQ and the client doing a PUT both *send* the file,
//! the server answering a WRQ and the client doing a GET both *receive* it.
//! Only the opening exchange differs.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::packet::{ErrorCode, MAX_DATA_SIZE, Packet};
use super::socket::{Received, Socket};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Timer settings shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long to wait for the peer before retransmitting.
    pub timeout: Duration,
    /// Consecutive timeouts after which the session gives up.
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Which way the file bytes flow, seen from the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file goes out as DATA (server RRQ, client PUT).
    Send,
    /// DATA comes in and is written locally (server WRQ, client GET).
    Receive,
}

/// How the session starts talking to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opening {
    /// The request was already received; answer it.
    Respond,
    /// Send this RRQ/WRQ and wait for the first reply.
    Request(Packet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Opening,
    Transferring,
    Done,
    Aborted,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Aborted)
    }
}

/// Why a session ended in [`State::Aborted`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer reported error {}: {msg}", code.as_u16())]
    PeerError { code: ErrorCode, msg: String },
    #[error("no response for block {block} after {retries} timeouts")]
    RetriesExhausted { block: u16, retries: u32 },
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session dropped before completion")]
    Cancelled,
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// DATA blocks accepted (including the final short one).
    pub blocks: u64,
    pub bytes: u64,
}

pub struct TransferSession<S: Socket> {
    socket: S,
    peer: SocketAddr,
    tid_bound: bool,
    direction: Direction,
    opening: Opening,
    name: String,
    path: PathBuf,
    file: Option<File>,
    created: bool,
    /// Send: block awaiting its ACK. Receive: last block acknowledged.
    block: u16,
    last_packet: Vec<u8>,
    last_payload_len: usize,
    retries: u32,
    deadline: Instant,
    state: State,
    config: SessionConfig,
    blocks: u64,
    bytes: u64,
    error: Option<SessionError>,
}

impl<S: Socket> TransferSession<S> {
    pub fn new(
        socket: S,
        peer: SocketAddr,
        direction: Direction,
        opening: Opening,
        name: &str,
        path: PathBuf,
        config: SessionConfig,
    ) -> Self {
        // A server session already knows the requester's port from the
        // request itself; only a client has to learn the server's TID.
        let tid_bound = opening == Opening::Respond;
        Self {
            socket,
            peer,
            tid_bound,
            direction,
            opening,
            name: name.to_string(),
            path,
            file: None,
            created: false,
            block: 0,
            last_packet: Vec::new(),
            last_payload_len: 0,
            retries: 0,
            deadline: Instant::now() + config.timeout,
            state: State::Opening,
            config,
            blocks: 0,
            bytes: 0,
            error: None,
        }
    }

    /// Server side of an RRQ received from `peer`.
    pub fn serve_read(socket: S, peer: SocketAddr, name: &str, path: PathBuf, config: SessionConfig) -> Self {
        Self::new(socket, peer, Direction::Send, Opening::Respond, name, path, config)
    }

    /// Server side of a WRQ received from `peer`.
    pub fn serve_write(socket: S, peer: SocketAddr, name: &str, path: PathBuf, config: SessionConfig) -> Self {
        Self::new(socket, peer, Direction::Receive, Opening::Respond, name, path, config)
    }

    /// Client GET: request `remote` from `server` and store it at `local`.
    pub fn download(socket: S, server: SocketAddr, remote: &str, local: &Path, config: SessionConfig) -> Self {
        Self::new(
            socket,
            server,
            Direction::Receive,
            Opening::Request(Packet::rrq(remote)),
            remote,
            local.to_path_buf(),
            config,
        )
    }

    /// Client PUT: send `local` to `server` under the name `remote`.
    pub fn upload(socket: S, server: SocketAddr, local: &Path, remote: &str, config: SessionConfig) -> Self {
        Self::new(
            socket,
            server,
            Direction::Send,
            Opening::Request(Packet::wrq(remote)),
            remote,
            local.to_path_buf(),
            config,
        )
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tid_bound(&self) -> bool {
        self.tid_bound
    }

    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    /// Drives the session from `Opening` to a terminal state.
    ///
    /// A server that received an upload lingers for one more timeout after
    /// the final ACK, so a client whose copy of that ACK was lost still gets
    /// an answer to its retransmitted last block.
    pub fn run(mut self) -> Result<TransferReport, SessionError> {
        self.open();

        while !self.state.is_terminal() {
            let wait = self.deadline.saturating_duration_since(Instant::now());
            match self.socket.recv_from(wait) {
                Ok(Received::Datagram(bytes, from)) => self.handle_datagram(&bytes, from),
                Ok(Received::TimedOut) => {
                    if Instant::now() >= self.deadline {
                        self.handle_timeout();
                    }
                }
                Err(e) => self.abort(SessionError::Transport(format!("{:#}", e))),
            }
        }

        if self.state == State::Done && self.direction == Direction::Receive && self.opening == Opening::Respond {
            self.dally();
        }

        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self.report()),
        }
    }

    pub fn report(&self) -> TransferReport {
        TransferReport {
            blocks: self.blocks,
            bytes: self.bytes,
        }
    }

    /// Performs the opening exchange.
    pub fn open(&mut self) {
        if self.state != State::Opening {
            return;
        }

        match self.direction {
            Direction::Send => {
                let opened = File::open(&self.path).and_then(|file| {
                    if file.metadata()?.is_dir() {
                        return Err(io::Error::new(ErrorKind::PermissionDenied, "is a directory"));
                    }
                    Ok(file)
                });
                match opened {
                    Ok(file) => self.file = Some(file),
                    Err(e) => {
                        if self.opening == Opening::Respond {
                            self.reply_error(open_error_code(&e));
                        }
                        self.abort(SessionError::Open {
                            path: self.path.clone(),
                            source: e,
                        });
                        return;
                    }
                }

                match self.opening.clone() {
                    Opening::Respond => self.send_next_block(),
                    Opening::Request(request) => {
                        // ACK(0) for the WRQ is answered like an ACK of a full block.
                        self.last_payload_len = MAX_DATA_SIZE;
                        self.transmit(&request);
                    }
                }
            }
            Direction::Receive => match self.opening.clone() {
                Opening::Respond => self.transmit(&Packet::Ack(0)),
                Opening::Request(request) => self.transmit(&request),
            },
        }

        if self.state == State::Opening {
            self.state = State::Transferring;
            log::debug!("{}: transferring", self.label());
        }
    }

    /// Applies the TID check, then feeds the packet to the state machine.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        if self.state.is_terminal() {
            return;
        }

        if !self.tid_bound {
            if from.ip() != self.peer.ip() {
                self.reject_tid(from);
                return;
            }
            if from != self.peer {
                log::debug!("{}: peer TID is {}", self.label(), from);
            }
            self.peer = from;
            self.tid_bound = true;
        } else if from != self.peer {
            self.reject_tid(from);
            return;
        }

        let packet = match Packet::deserialize(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("{}: ignoring bad packet: {}", self.label(), e);
                return;
            }
        };
        log::debug!("{}: <- {}", self.label(), packet);

        let final_block = packet.is_final_data();
        match (self.direction, packet) {
            (_, Packet::Error { code, msg }) => {
                self.abort(SessionError::PeerError { code, msg });
            }
            (Direction::Send, Packet::Ack(block)) => self.on_ack(block),
            (Direction::Receive, Packet::Data { block_num, data }) => {
                self.on_data(block_num, &data, final_block)
            }
            (_, other) => {
                log::debug!("{}: unexpected {}, ignored", self.label(), other);
            }
        }
    }

    /// Called once the deadline has passed without progress.
    pub fn handle_timeout(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        self.retries += 1;
        if self.retries >= self.config.max_retries {
            self.abort(SessionError::RetriesExhausted {
                block: self.block,
                retries: self.retries,
            });
            return;
        }

        log::warn!(
            "{}: timeout on block {}, retransmitting ({}/{})",
            self.label(),
            self.block,
            self.retries,
            self.config.max_retries
        );
        if let Err(e) = self.socket.send_raw(&self.last_packet, self.peer) {
            self.abort(SessionError::Transport(format!("{:#}", e)));
            return;
        }
        self.rearm();
    }

    /// Re-acknowledges a repeated final block until the peer goes quiet.
    fn dally(&mut self) {
        let until = Instant::now() + self.config.timeout;
        loop {
            let wait = until.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                break;
            }
            match self.socket.recv_from(wait) {
                Ok(Received::Datagram(bytes, from)) if from == self.peer => {
                    if let Ok(Packet::Data { block_num, .. }) = Packet::deserialize(&bytes) {
                        if block_num == self.block {
                            log::debug!("{}: final DATA #{} repeated, re-acknowledging", self.label(), block_num);
                            if self.socket.send_raw(&self.last_packet, self.peer).is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(Received::Datagram(_, from)) => self.reject_tid(from),
                Ok(Received::TimedOut) => {}
                Err(_) => break,
            }
        }
    }

    fn on_ack(&mut self, block: u16) {
        if block != self.block {
            log::debug!("{}: stale ACK #{} (waiting for #{})", self.label(), block, self.block);
            return;
        }

        self.retries = 0;
        if self.last_payload_len < MAX_DATA_SIZE {
            self.complete();
        } else {
            self.send_next_block();
        }
    }

    fn on_data(&mut self, block: u16, data: &[u8], final_block: bool) {
        let expected = self.block.wrapping_add(1);

        if block == expected {
            if let Err(e) = self.write_block(data) {
                return self.abort(e);
            }
            self.block = block;
            self.blocks += 1;
            self.bytes += data.len() as u64;
            self.retries = 0;
            self.transmit(&Packet::Ack(block));

            if final_block && !self.state.is_terminal() {
                self.complete();
            }
        } else if block == self.block && self.blocks > 0 {
            // Our ACK was lost; repeat it without touching the file.
            log::debug!("{}: duplicate DATA #{}, re-acknowledging", self.label(), block);
            if let Err(e) = self.socket.send_to(&Packet::Ack(block), self.peer) {
                self.abort(SessionError::Transport(format!("{:#}", e)));
            }
        } else {
            log::debug!("{}: out of order DATA #{} (expected #{})", self.label(), block, expected);
        }
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.file.is_none() {
            match File::create(&self.path) {
                Ok(file) => {
                    self.file = Some(file);
                    self.created = true;
                }
                Err(e) => {
                    self.reply_error(write_error_code(&e));
                    return Err(SessionError::Open {
                        path: self.path.clone(),
                        source: e,
                    });
                }
            }
        }

        let result = match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Ok(()),
        };
        result.map_err(|e| {
            self.reply_error(write_error_code(&e));
            SessionError::Io {
                path: self.path.clone(),
                source: e,
            }
        })
    }

    fn send_next_block(&mut self) {
        let mut data = Vec::with_capacity(MAX_DATA_SIZE);
        let read = match self.file.as_mut() {
            Some(file) => file.take(MAX_DATA_SIZE as u64).read_to_end(&mut data),
            None => Ok(0),
        };
        if let Err(e) = read {
            self.reply_error(ErrorCode::NotDefined);
            return self.abort(SessionError::Io {
                path: self.path.clone(),
                source: e,
            });
        }

        self.block = self.block.wrapping_add(1);
        self.last_payload_len = data.len();
        self.blocks += 1;
        self.bytes += data.len() as u64;
        self.transmit(&Packet::Data {
            block_num: self.block,
            data,
        });
    }

    /// Sends a packet to the peer and remembers it for retransmission.
    fn transmit(&mut self, packet: &Packet) {
        log::debug!("{}: -> {}", self.label(), packet);
        let sent = packet
            .serialize()
            .map_err(anyhow::Error::from)
            .and_then(|bytes| {
                self.socket.send_raw(&bytes, self.peer)?;
                Ok(bytes)
            });

        match sent {
            Ok(bytes) => {
                self.last_packet = bytes;
                self.rearm();
            }
            Err(e) => self.abort(SessionError::Transport(format!("{:#}", e))),
        }
    }

    /// Best effort ERROR to the peer; the session is ending anyway.
    fn reply_error(&self, code: ErrorCode) {
        if let Err(e) = self.socket.send_to(&Packet::error(code), self.peer) {
            log::debug!("{}: could not send {}: {:#}", self.label(), code, e);
        }
    }

    fn reject_tid(&self, from: SocketAddr) {
        log::warn!(
            "{}: datagram from unknown TID {} (bound to {})",
            self.label(),
            from,
            self.peer
        );
        if let Err(e) = self.socket.send_to(&Packet::error(ErrorCode::UnknownTransferId), from) {
            log::debug!("{}: could not answer {}: {:#}", self.label(), from, e);
        }
    }

    fn rearm(&mut self) {
        self.deadline = Instant::now() + self.config.timeout;
    }

    fn complete(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                return self.abort(SessionError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            }
        }
        self.state = State::Done;
        log::info!(
            "{}: '{}' complete ({} blocks, {} bytes)",
            self.label(),
            self.name,
            self.blocks,
            self.bytes
        );
    }

    fn abort(&mut self, reason: SessionError) {
        if self.state.is_terminal() {
            return;
        }

        self.state = State::Aborted;
        self.file = None;
        if self.direction == Direction::Receive && self.created {
            match fs::remove_file(&self.path) {
                Ok(()) => log::debug!("{}: removed partial {}", self.label(), self.path.display()),
                Err(e) => log::warn!(
                    "{}: could not remove partial {}: {}",
                    self.label(),
                    self.path.display(),
                    e
                ),
            }
        }
        log::warn!("{}: '{}' aborted: {}", self.label(), self.name, reason);
        self.error = Some(reason);
    }

    fn label(&self) -> String {
        match self.socket.local_addr() {
            Ok(local) => format!("[{} <-> {}]", local, self.peer),
            Err(_) => format!("[{}]", self.peer),
        }
    }
}

impl<S: Socket> Drop for TransferSession<S> {
    fn drop(&mut self) {
        self.abort(SessionError::Cancelled);
    }
}

fn open_error_code(e: &io::Error) -> ErrorCode {
    match e.kind() {
        ErrorKind::NotFound => ErrorCode::FileNotFound,
        _ => ErrorCode::AccessViolation,
    }
}

fn write_error_code(e: &io::Error) -> ErrorCode {
    match e.kind() {
        ErrorKind::StorageFull | ErrorKind::FileTooLarge => ErrorCode::DiskFull,
        _ => ErrorCode::AccessViolation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Outbox = Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>;

    /// In-memory transport: queued datagrams in, recorded datagrams out.
    struct MemorySocket {
        local: SocketAddr,
        inbox: Mutex<VecDeque<Received>>,
        outbox: Outbox,
    }

    impl MemorySocket {
        fn new() -> (Self, Outbox) {
            let outbox = Outbox::default();
            let socket = Self {
                local: "127.0.0.1:40000".parse().unwrap(),
                inbox: Mutex::new(VecDeque::new()),
                outbox: Arc::clone(&outbox),
            };
            (socket, outbox)
        }
    }

    impl Socket for MemorySocket {
        fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> anyhow::Result<()> {
            self.outbox.lock().unwrap().push((bytes.to_vec(), to));
            Ok(())
        }

        fn recv_from(&self, _timeout: Duration) -> anyhow::Result<Received> {
            Ok(self
                .inbox
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Received::TimedOut))
        }

        fn local_addr(&self) -> anyhow::Result<SocketAddr> {
            Ok(self.local)
        }
    }

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn sent(outbox: &Outbox) -> Vec<(Packet, SocketAddr)> {
        outbox
            .lock()
            .unwrap()
            .iter()
            .map(|(bytes, to)| (Packet::deserialize(bytes).unwrap(), *to))
            .collect()
    }

    fn last_sent(outbox: &Outbox) -> Packet {
        sent(outbox).pop().unwrap().0
    }

    fn bytes(packet: Packet) -> Vec<u8> {
        packet.serialize().unwrap()
    }

    fn data(block_num: u16, len: usize) -> Vec<u8> {
        bytes(Packet::Data {
            block_num,
            data: vec![block_num as u8; len],
        })
    }

    fn fixture(content: &[u8]) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_send_empty_file() {
        let (_dir, path) = fixture(b"");
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_read(socket, client(), "a.txt", path, SessionConfig::default());

        session.open();
        assert_eq!(session.state(), State::Transferring);
        assert_eq!(
            sent(&outbox),
            vec![(Packet::Data { block_num: 1, data: vec![] }, client())]
        );

        session.handle_datagram(&bytes(Packet::Ack(1)), client());
        assert_eq!(session.state(), State::Done);
        assert_eq!(session.report(), TransferReport { blocks: 1, bytes: 0 });
    }

    #[test]
    fn test_send_exact_multiple_ends_with_empty_block() {
        let content: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        let (_dir, path) = fixture(&content);
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_read(socket, client(), "b.bin", path, SessionConfig::default());

        session.open();
        for block in 1..=3u16 {
            match last_sent(&outbox) {
                Packet::Data { block_num, data } => {
                    assert_eq!(block_num, block);
                    let start = (block as usize - 1) * MAX_DATA_SIZE;
                    let end = (start + MAX_DATA_SIZE).min(content.len());
                    assert_eq!(data, content[start.min(end)..end]);
                }
                other => panic!("expected DATA, got {}", other),
            }
            session.handle_datagram(&bytes(Packet::Ack(block)), client());
        }

        assert_eq!(session.state(), State::Done);
        assert_eq!(session.report(), TransferReport { blocks: 3, bytes: 1024 });
        assert_eq!(outbox.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let (_dir, path) = fixture(&[7u8; 1500]);
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_read(socket, client(), "c.bin", path, SessionConfig::default());

        session.open();
        session.handle_datagram(&bytes(Packet::Ack(1)), client());
        assert_eq!(session.block(), 2);
        let before = outbox.lock().unwrap().len();

        session.handle_datagram(&bytes(Packet::Ack(1)), client());
        assert_eq!(session.block(), 2);
        assert_eq!(outbox.lock().unwrap().len(), before);
        assert_eq!(session.state(), State::Transferring);
    }

    #[test]
    fn test_timeout_retransmits_identical_bytes_then_aborts() {
        let (_dir, path) = fixture(&[1u8; 700]);
        let (socket, outbox) = MemorySocket::new();
        let config = SessionConfig {
            timeout: Duration::from_millis(10),
            max_retries: 3,
        };
        let mut session = TransferSession::serve_read(socket, client(), "d.bin", path, config);

        session.open();
        let original = outbox.lock().unwrap()[0].0.clone();

        session.handle_timeout();
        session.handle_timeout();
        {
            let out = outbox.lock().unwrap();
            assert_eq!(out.len(), 3);
            assert!(out.iter().all(|(b, _)| *b == original));
        }
        assert_eq!(session.state(), State::Transferring);

        session.handle_timeout();
        assert_eq!(session.state(), State::Aborted);
        assert_eq!(outbox.lock().unwrap().len(), 3);
        assert!(matches!(
            session.error(),
            Some(SessionError::RetriesExhausted { block: 1, retries: 3 })
        ));
    }

    #[test]
    fn test_missing_file_sends_file_not_found() {
        let dir = TempDir::new().unwrap();
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_read(
            socket,
            client(),
            "missing.txt",
            dir.path().join("missing.txt"),
            SessionConfig::default(),
        );

        session.open();
        assert_eq!(session.state(), State::Aborted);
        assert_eq!(sent(&outbox), vec![(Packet::error(ErrorCode::FileNotFound), client())]);
        assert!(matches!(session.error(), Some(SessionError::Open { .. })));
    }

    #[test]
    fn test_receive_defers_file_creation_and_handles_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("up.bin");
        let (socket, outbox) = MemorySocket::new();
        let mut session =
            TransferSession::serve_write(socket, client(), "up.bin", path.clone(), SessionConfig::default());

        session.open();
        assert_eq!(last_sent(&outbox), Packet::Ack(0));
        assert!(!path.exists());

        session.handle_datagram(&data(1, 512), client());
        assert_eq!(last_sent(&outbox), Packet::Ack(1));
        assert!(path.exists());

        // Duplicate of block 1: re-acknowledged, not written twice.
        session.handle_datagram(&data(1, 512), client());
        assert_eq!(last_sent(&outbox), Packet::Ack(1));
        assert_eq!(session.block(), 1);

        // Out of sequence block is dropped.
        session.handle_datagram(&data(3, 10), client());
        assert_eq!(session.block(), 1);

        session.handle_datagram(&data(2, 10), client());
        assert_eq!(last_sent(&outbox), Packet::Ack(2));
        assert_eq!(session.state(), State::Done);

        let written = fs::read(&path).unwrap();
        assert_eq!(written.len(), 522);
        assert!(written[..512].iter().all(|&b| b == 1));
        assert!(written[512..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_receive_timeout_resends_last_ack() {
        let dir = TempDir::new().unwrap();
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_write(
            socket,
            client(),
            "t.bin",
            dir.path().join("t.bin"),
            SessionConfig::default(),
        );

        session.open();
        session.handle_datagram(&data(1, 512), client());
        session.handle_timeout();

        let out = sent(&outbox);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], out[2]);
        assert_eq!(out[2].0, Packet::Ack(1));
    }

    #[test]
    fn test_peer_error_deletes_partial_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        let (socket, _outbox) = MemorySocket::new();
        let mut session =
            TransferSession::serve_write(socket, client(), "partial.bin", path.clone(), SessionConfig::default());

        session.open();
        session.handle_datagram(&data(1, 512), client());
        assert!(path.exists());

        session.handle_datagram(&bytes(Packet::error(ErrorCode::DiskFull)), client());
        assert_eq!(session.state(), State::Aborted);
        assert!(!path.exists());
        assert!(matches!(
            session.error(),
            Some(SessionError::PeerError { code: ErrorCode::DiskFull, .. })
        ));
    }

    #[test]
    fn test_retry_exhaustion_deletes_partial_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stalled.bin");
        let (socket, _outbox) = MemorySocket::new();
        let config = SessionConfig {
            timeout: Duration::from_millis(10),
            max_retries: 2,
        };
        let mut session = TransferSession::serve_write(socket, client(), "stalled.bin", path.clone(), config);

        session.open();
        session.handle_datagram(&data(1, 512), client());
        session.handle_timeout();
        session.handle_timeout();

        assert_eq!(session.state(), State::Aborted);
        assert!(!path.exists());
    }

    #[test]
    fn test_unknown_tid_is_rejected_without_state_change() {
        let (_dir, path) = fixture(&[9u8; 1024]);
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_read(socket, client(), "e.bin", path, SessionConfig::default());

        session.open();
        session.handle_datagram(&bytes(Packet::Ack(1)), client());
        assert!(session.is_tid_bound());
        assert_eq!(session.block(), 2);

        let imposter: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        session.handle_datagram(&bytes(Packet::Ack(2)), imposter);

        assert_eq!(
            last_sent(&outbox),
            Packet::error(ErrorCode::UnknownTransferId)
        );
        assert_eq!(sent(&outbox).last().unwrap().1, imposter);
        assert_eq!(session.block(), 2);
        assert_eq!(session.state(), State::Transferring);
        assert_eq!(session.peer(), client());

        session.handle_datagram(&bytes(Packet::Ack(2)), client());
        assert_eq!(session.block(), 3);
    }

    #[test]
    fn test_server_session_is_bound_to_requester_port() {
        let (_dir, path) = fixture(&[3u8; 700]);
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::serve_read(socket, client(), "h.bin", path, SessionConfig::default());
        assert!(session.is_tid_bound());

        session.open();
        let deadline = session.deadline;

        // Same host, other port, arriving before the requester's first ACK.
        let neighbour: SocketAddr = "127.0.0.1:50002".parse().unwrap();
        session.handle_datagram(&bytes(Packet::Ack(1)), neighbour);

        assert_eq!(
            sent(&outbox).last().unwrap(),
            &(Packet::error(ErrorCode::UnknownTransferId), neighbour)
        );
        assert_eq!(session.peer(), client());
        assert_eq!(session.block(), 1);
        assert_eq!(session.state(), State::Transferring);
        assert_eq!(session.deadline, deadline);

        session.handle_datagram(&bytes(Packet::Ack(1)), client());
        assert_eq!(session.block(), 2);
        assert_eq!(sent(&outbox).last().unwrap().1, client());
    }

    #[test]
    fn test_unbound_client_session_rejects_other_hosts() {
        let dir = TempDir::new().unwrap();
        let server: SocketAddr = "127.0.0.1:69".parse().unwrap();
        let (socket, outbox) = MemorySocket::new();
        let mut session =
            TransferSession::download(socket, server, "f.txt", &dir.path().join("f.txt"), SessionConfig::default());

        session.open();
        assert!(!session.is_tid_bound());
        let stranger: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        session.handle_datagram(&data(1, 3), stranger);

        assert!(!session.is_tid_bound());
        assert_eq!(session.state(), State::Transferring);
        assert_eq!(
            sent(&outbox).last().unwrap(),
            &(Packet::error(ErrorCode::UnknownTransferId), stranger)
        );
        assert!(!dir.path().join("f.txt").exists());
    }

    #[test]
    fn test_create_failure_sends_access_violation() {
        let dir = TempDir::new().unwrap();
        // The target is an existing directory, so it cannot be created as a file.
        let target = dir.path().join("taken");
        fs::create_dir(&target).unwrap();
        let (socket, outbox) = MemorySocket::new();
        let mut session =
            TransferSession::serve_write(socket, client(), "taken", target.clone(), SessionConfig::default());

        session.open();
        session.handle_datagram(&data(1, 512), client());

        assert_eq!(session.state(), State::Aborted);
        assert_eq!(
            sent(&outbox).last().unwrap(),
            &(Packet::error(ErrorCode::AccessViolation), client())
        );
        assert!(matches!(session.error(), Some(SessionError::Open { .. })));
        // Nothing was created, so nothing is removed.
        assert!(target.is_dir());
    }

    #[test]
    fn test_missing_parent_directory_aborts_upload() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("no_such_dir").join("file.bin");
        let (socket, outbox) = MemorySocket::new();
        let mut session =
            TransferSession::serve_write(socket, client(), "no_such_dir/file.bin", target.clone(), SessionConfig::default());

        session.open();
        session.handle_datagram(&data(1, 10), client());

        assert_eq!(session.state(), State::Aborted);
        assert!(matches!(last_sent(&outbox), Packet::Error { .. }));
        assert!(matches!(session.error(), Some(SessionError::Open { .. })));
        assert!(!target.exists());
    }

    #[test]
    fn test_server_reacknowledges_repeated_final_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last.bin");
        let (socket, outbox) = MemorySocket::new();
        {
            let mut inbox = socket.inbox.lock().unwrap();
            inbox.push_back(Received::Datagram(data(1, 10), client()));
            // The client never saw ACK(1) and sends its last block again.
            inbox.push_back(Received::Datagram(data(1, 10), client()));
        }
        let config = SessionConfig {
            timeout: Duration::from_millis(30),
            max_retries: 3,
        };

        let session = TransferSession::serve_write(socket, client(), "last.bin", path.clone(), config);
        let report = session.run().unwrap();

        assert_eq!(report, TransferReport { blocks: 1, bytes: 10 });
        let acks: Vec<Packet> = sent(&outbox).into_iter().map(|(p, _)| p).collect();
        assert_eq!(acks, vec![Packet::Ack(0), Packet::Ack(1), Packet::Ack(1)]);
        assert_eq!(fs::read(&path).unwrap().len(), 10);
    }

    #[test]
    fn test_upload_binds_to_server_transfer_port() {
        let (_dir, path) = fixture(&[5u8; 100]);
        let server: SocketAddr = "127.0.0.1:69".parse().unwrap();
        let transfer_port: SocketAddr = "127.0.0.1:41234".parse().unwrap();
        let (socket, outbox) = MemorySocket::new();
        let mut session = TransferSession::upload(socket, server, &path, "remote.bin", SessionConfig::default());

        session.open();
        assert_eq!(sent(&outbox), vec![(Packet::wrq("remote.bin"), server)]);

        session.handle_datagram(&bytes(Packet::Ack(0)), transfer_port);
        assert!(session.is_tid_bound());
        assert_eq!(session.peer(), transfer_port);
        assert_eq!(
            sent(&outbox).last().unwrap(),
            &(
                Packet::Data {
                    block_num: 1,
                    data: vec![5u8; 100]
                },
                transfer_port
            )
        );

        session.handle_datagram(&bytes(Packet::Ack(1)), transfer_port);
        assert_eq!(session.state(), State::Done);
    }

    #[test]
    fn test_download_retransmits_request_until_answered() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("local.txt");
        let server: SocketAddr = "127.0.0.1:69".parse().unwrap();
        let (socket, outbox) = MemorySocket::new();
        let mut session =
            TransferSession::download(socket, server, "remote.txt", &local, SessionConfig::default());

        session.open();
        session.handle_timeout();
        let out = sent(&outbox);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(p, to)| *p == Packet::rrq("remote.txt") && *to == server));

        let transfer_port: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        session.handle_datagram(
            &bytes(Packet::Data {
                block_num: 1,
                data: b"hello".to_vec(),
            }),
            transfer_port,
        );
        assert_eq!(session.state(), State::Done);
        assert_eq!(sent(&outbox).last().unwrap(), &(Packet::Ack(1), transfer_port));
        assert_eq!(fs::read(&local).unwrap(), b"hello");
    }

    #[test]
    fn test_download_error_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("nothing.txt");
        let server: SocketAddr = "127.0.0.1:69".parse().unwrap();
        let (socket, _outbox) = MemorySocket::new();
        let mut session =
            TransferSession::download(socket, server, "nothing.txt", &local, SessionConfig::default());

        session.open();
        session.handle_datagram(&bytes(Packet::error(ErrorCode::FileNotFound)), server);

        assert_eq!(session.state(), State::Aborted);
        assert!(!local.exists());
    }

    #[test]
    fn test_run_over_memory_socket() {
        let (_dir, path) = fixture(b"xyz");
        let (socket, outbox) = MemorySocket::new();
        socket
            .inbox
            .lock()
            .unwrap()
            .push_back(Received::Datagram(bytes(Packet::Ack(1)), client()));

        let session = TransferSession::serve_read(socket, client(), "g.txt", path, SessionConfig::default());
        let report = session.run().unwrap();

        assert_eq!(report, TransferReport { blocks: 1, bytes: 3 });
        assert_eq!(outbox.lock().unwrap().len(), 1);
    }
}
