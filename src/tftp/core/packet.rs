use std::fmt;

/// Largest DATA payload RFC 1350 allows.
pub const MAX_DATA_SIZE: usize = 512;
/// Opcode + block number + full payload.
pub const MAX_PACKET_SIZE: usize = MAX_DATA_SIZE + 4;

/// The only transfer mode this implementation speaks.
pub const OCTET_MODE: &str = "octet";

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

/// Errors produced while decoding or encoding a [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unsupported transfer mode '{0}'")]
    UnsupportedMode(String),
}

impl PacketError {
    /// The ERROR code a peer should receive for this decode failure.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::IllegalOperation
    }
}

/// TFTP error codes (RFC 1350, section 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
    /// A code outside the RFC 1350 table, kept so it can be reported.
    Other(u16),
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::NotDefined,
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::NotDefined => 0,
            Self::FileNotFound => 1,
            Self::AccessViolation => 2,
            Self::DiskFull => 3,
            Self::IllegalOperation => 4,
            Self::UnknownTransferId => 5,
            Self::FileAlreadyExists => 6,
            Self::NoSuchUser => 7,
            Self::Other(code) => code,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined | Self::Other(_) => "Not defined",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// A decoded TFTP packet.
///
/// Requests only ever carry `"octet"` as their mode: decoding rejects any
/// other mode with [`PacketError::UnsupportedMode`], so the field is kept
/// only to echo what the peer actually sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: String },
    Wrq { filename: String, mode: String },
    Data { block_num: u16, data: Vec<u8> },
    Ack(u16),
    Error { code: ErrorCode, msg: String },
}

impl Packet {
    /// Builds an ERROR packet carrying the code's standard message.
    pub fn error(code: ErrorCode) -> Self {
        Packet::Error {
            code,
            msg: code.default_message().to_string(),
        }
    }

    pub fn rrq(filename: &str) -> Self {
        Packet::Rrq {
            filename: filename.to_string(),
            mode: OCTET_MODE.to_string(),
        }
    }

    pub fn wrq(filename: &str) -> Self {
        Packet::Wrq {
            filename: filename.to_string(),
            mode: OCTET_MODE.to_string(),
        }
    }

    /// True for a DATA packet whose payload is shorter than a full block.
    pub fn is_final_data(&self) -> bool {
        matches!(self, Packet::Data { data, .. } if data.len() < MAX_DATA_SIZE)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);

        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                let opcode = if matches!(self, Packet::Rrq { .. }) {
                    OPCODE_RRQ
                } else {
                    OPCODE_WRQ
                };
                buf.extend_from_slice(&opcode.to_be_bytes());
                push_cstr(&mut buf, filename)?;
                push_cstr(&mut buf, mode)?;
            }
            Packet::Data { block_num, data } => {
                if data.len() > MAX_DATA_SIZE {
                    return Err(PacketError::Malformed("DATA payload exceeds 512 bytes"));
                }
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block_num) => {
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
            }
            Packet::Error { code, msg } => {
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_cstr(&mut buf, msg)?;
            }
        }

        if buf.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Malformed("encoded packet exceeds 516 bytes"));
        }

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::Malformed("packet shorter than 4 bytes"));
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let body = &buf[2..];

        match opcode {
            OPCODE_RRQ | OPCODE_WRQ => {
                let (filename, rest) = take_cstr(body)?;
                let (mode, _) = take_cstr(rest)?;
                if !filename.is_ascii() || !mode.is_ascii() {
                    return Err(PacketError::Malformed("request strings must be ASCII"));
                }
                if !mode.eq_ignore_ascii_case(OCTET_MODE) {
                    return Err(PacketError::UnsupportedMode(mode));
                }
                if opcode == OPCODE_RRQ {
                    Ok(Packet::Rrq { filename, mode })
                } else {
                    Ok(Packet::Wrq { filename, mode })
                }
            }
            OPCODE_DATA => {
                let data = &body[2..];
                if data.len() > MAX_DATA_SIZE {
                    return Err(PacketError::Malformed("DATA payload exceeds 512 bytes"));
                }
                Ok(Packet::Data {
                    block_num: u16::from_be_bytes([body[0], body[1]]),
                    data: data.to_vec(),
                })
            }
            OPCODE_ACK => Ok(Packet::Ack(u16::from_be_bytes([body[0], body[1]]))),
            OPCODE_ERROR => {
                let code = ErrorCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
                let (msg, _) = take_cstr(&body[2..])?;
                Ok(Packet::Error { code, msg })
            }
            _ => Err(PacketError::Malformed("unknown opcode")),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Rrq { filename, mode } => write!(f, "RRQ '{}' ({})", filename, mode),
            Packet::Wrq { filename, mode } => write!(f, "WRQ '{}' ({})", filename, mode),
            Packet::Data { block_num, data } => {
                write!(f, "DATA #{} ({} bytes)", block_num, data.len())
            }
            Packet::Ack(block_num) => write!(f, "ACK #{}", block_num),
            Packet::Error { code, msg } => write!(f, "ERROR {}: {}", code.as_u16(), msg),
        }
    }
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) -> Result<(), PacketError> {
    if s.as_bytes().contains(&0) {
        return Err(PacketError::Malformed("string contains NUL"));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

/// Splits off one NUL-terminated string, returning it and the bytes after the NUL.
fn take_cstr(buf: &[u8]) -> Result<(String, &[u8]), PacketError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Malformed("missing NUL terminator"))?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    Ok((s, &buf[end + 1..]))
}
