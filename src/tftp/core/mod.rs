//! TFTP core protocol implementation
//!
//! This module contains the pieces shared by the server and the client:
//! - `packet`: packet serialization and deserialization
//! - `socket`: datagram transport with bounded receives
//! - `session`: the stop-and-wait transfer state machine
//! - `lock`: per-filename reader/writer locks

pub mod lock;
mod packet;
pub mod session;
mod socket;

// Public core types
pub use lock::{FileGuard, LockRegistry, ReadGuard, WriteGuard};
pub use packet::{ErrorCode, MAX_DATA_SIZE, MAX_PACKET_SIZE, OCTET_MODE, Packet, PacketError};
pub use session::{
    Direction, Opening, SessionConfig, SessionError, State, TransferReport, TransferSession,
};
pub use socket::{Received, Socket};
