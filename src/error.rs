//! Error types for the audio transport

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket and node errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Send to {addr} failed: {reason}")]
    SendFailed { addr: SocketAddr, reason: String },

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Could not resolve address: {0}")]
    Resolve(String),

    #[error("Node is shut down")]
    Closed,
}

/// Wire codec errors. A datagram failing to parse is dropped, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown endpoint type {0}")]
    UnknownType(u8),

    #[error("Unknown message kind {0}")]
    UnknownMessage(u8),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid string field")]
    InvalidString,

    #[error("Field too long: {0} bytes")]
    FieldTooLong(usize),

    #[error("Control frame error: {0}")]
    Frame(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Unsupported codec: {0}")]
    Unsupported(String),
}

/// Structured error codes reported by the rendezvous server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    WrongPassword,
    AlreadyLoggedIn,
    AlreadyInGroup,
    NotInGroup,
    NotLoggedIn,
    VersionMismatch,
    Internal,
}

/// Session layer errors, delivered through the reply of the failed request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Request rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Disconnected")]
    Disconnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Unknown peer or group: {0}")]
    UnknownTarget(String),

    #[error("No node attached")]
    NoNode,
}

/// Stream (source/sink) errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Not set up")]
    NotSetUp,

    #[error("Channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
