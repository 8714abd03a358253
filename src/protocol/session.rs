//! Session control messages
//!
//! The client/server control channel runs over TCP. Each frame is a
//! big-endian `u32` length followed by a bincode body. Unreliable peer
//! messages travel as UDP datagrams through the node instead.

use std::io::{Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ensure, get_str, peek_header, put_str, EndpointType, Header, HEADER_SIZE, ID_WILDCARD};
use crate::error::{ErrorCode, ProtocolError};
use crate::time::TimeTag;

/// Session protocol version sent with the login request
pub const SESSION_VERSION: u32 = 1;

/// Largest accepted control frame
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Datagram kind of a [`PeerMessage`]
pub const KIND_PEER_MESSAGE: u8 = 20;

/// Who a relayed message is for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayTarget {
    /// Every peer in every group the sender is a member of
    Broadcast,
    /// Every peer in one group
    Group(String),
    /// One peer in one group
    Peer { group: String, user_id: u32 },
}

/// Reason a request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    Login {
        token: u32,
        version: u32,
        user: String,
        password: String,
        /// Port of the client's node, combined with the TCP peer address
        udp_port: u16,
    },
    Logout { token: u32 },
    JoinGroup { token: u32, group: String, password: String },
    LeaveGroup { token: u32, group: String },
    Relay { target: RelayTarget, time_tag: TimeTag, payload: Vec<u8> },
    Ping,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerResponse {
    LoginReply { token: u32, result: Result<u32, Rejection> },
    LogoutReply { token: u32 },
    JoinReply { token: u32, group: String, result: Result<(), Rejection> },
    LeaveReply { token: u32, group: String, result: Result<(), Rejection> },
    PeerJoin { group: String, user: String, user_id: u32, address: SocketAddr },
    PeerLeave { group: String, user: String, user_id: u32 },
    Message { group: String, user: String, user_id: u32, time_tag: TimeTag, payload: Vec<u8> },
    Pong,
}

/// Serialize a control message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let body = bincode::serialize(message).map_err(|e| ProtocolError::Frame(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FieldTooLong(body.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Parse a frame body (without its length prefix)
pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(body).map_err(|e| ProtocolError::Frame(e.to_string()))
}

/// Blocking write of one frame
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> std::io::Result<()> {
    let frame = encode_frame(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Blocking read of one frame
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> std::io::Result<T> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes", len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode_frame(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Best-effort message sent directly between clients over UDP
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    pub group: String,
    pub from_user_id: u32,
    pub time_tag: TimeTag,
    pub payload: Bytes,
}

impl PeerMessage {
    /// `[group str][user id u32][time tag u64][payload len u32][payload]`
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.group.len() + 18 + self.payload.len());
        Header::new(EndpointType::Client, ID_WILDCARD, KIND_PEER_MESSAGE).encode(&mut buf);
        put_str(&mut buf, &self.group)?;
        buf.put_u32(self.from_user_id);
        buf.put_u64(self.time_tag.raw());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = peek_header(data)?;
        if header.recipient != EndpointType::Client || header.kind != KIND_PEER_MESSAGE {
            return Err(ProtocolError::UnknownMessage(header.kind));
        }
        let mut buf = &data[HEADER_SIZE..];
        let group = get_str(&mut buf)?;
        ensure(&buf, 16)?;
        let from_user_id = buf.get_u32();
        let time_tag = TimeTag::from_raw(buf.get_u64());
        let len = buf.get_u32() as usize;
        ensure(&buf, len)?;
        let payload = Bytes::copy_from_slice(&buf[..len]);
        Ok(Self { group, from_user_id, time_tag, payload })
    }
}
