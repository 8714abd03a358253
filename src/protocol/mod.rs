//! Wire protocol
//!
//! Every datagram starts with a fixed header so the node can route it
//! without looking at the rest of the payload:
//!
//! ```text
//! ┌─────────┬────────────────┬──────────────────┬──────────────┬──────────┐
//! │ version │ recipient type │ recipient id     │ message kind │ body ... │
//! │  u8     │  u8            │  i32 (BE, -1=*)  │  u8          │          │
//! └─────────┴────────────────┴──────────────────┴──────────────┴──────────┘
//! ```
//!
//! All integers are big-endian; strings and byte fields are length-prefixed.

pub mod format;
pub mod session;
pub mod stream;

pub use format::{BitDepth, Bitrate, CodecParams, Complexity, Format, SignalType};
pub use session::{ClientRequest, PeerMessage, RelayTarget, Rejection, ServerResponse};
pub use stream::{DataFrame, StreamMessage};

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Wire protocol version carried in every datagram
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the routing header
pub const HEADER_SIZE: usize = 7;

/// Matches any local id of the addressed type
pub const ID_WILDCARD: i32 = -1;

/// Kind of local endpoint a datagram is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EndpointType {
    Source = 0,
    Sink = 1,
    Client = 2,
    Server = 3,
    Peer = 4,
}

impl EndpointType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Self::Source,
            1 => Self::Sink,
            2 => Self::Client,
            3 => Self::Server,
            4 => Self::Peer,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Routing header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub recipient: EndpointType,
    pub id: i32,
    pub kind: u8,
}

impl Header {
    pub fn new(recipient: EndpointType, id: i32, kind: u8) -> Self {
        Self { recipient, id, kind }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.recipient as u8);
        buf.put_i32(self.id);
        buf.put_u8(self.kind);
    }

    pub fn is_wildcard(&self) -> bool {
        self.id == ID_WILDCARD
    }
}

/// Parse only the routing header of a datagram
pub fn peek_header(data: &[u8]) -> Result<Header, ProtocolError> {
    let mut buf = data;
    ensure(&buf, HEADER_SIZE)?;
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let recipient = EndpointType::from_u8(buf.get_u8())?;
    let id = buf.get_i32();
    let kind = buf.get_u8();
    Ok(Header { recipient, id, kind })
}

/// Fail with `Truncated` unless `n` more bytes are readable
pub(crate) fn ensure(buf: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated { needed: n, available: buf.remaining() })
    } else {
        Ok(())
    }
}

pub(crate) fn put_str(buf: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn get_str(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(&*buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(&*buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
}
