//! # AOO Transport
//!
//! Peer-to-peer low-latency audio over UDP with adaptive jitter buffering,
//! retransmission of lost blocks and a small rendezvous session layer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── PEER A ─────────────────────────────┐
//! │  audio callback                                                 │
//! │     │  DejitterClock::tick() ──► virtual time                   │
//! │     ▼                                                           │
//! │  Source::process() ──► encode once per format ──► fan out       │
//! │     │                        (history buffer for resends)       │
//! │     ▼                                                           │
//! │  outgoing queue ──► notify() ──► Node send thread ──┐           │
//! │                                                     │ one UDP   │
//! │  Client ◄── TCP control channel ──► relay Server    │ socket    │
//! └─────────────────────────────────────────────────────┼───────────┘
//!                                                       │
//! ┌──────────────────────────── PEER B ─────────────────┼───────────┐
//! │  Node receive thread ◄──────────────────────────────┘           │
//! │     │  route by [type][id] header                               │
//! │     ▼                                                           │
//! │  Sink::handle_message() ──► jitter buffer ──► resend requests   │
//! │     │                                                           │
//! │  audio callback: Sink::process() ──► decode ──► output channels │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Audio always flows directly between peers. The relay server only
//! introduces peers to each other and forwards reliable messages.

pub mod audio;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod time;

pub use error::{Error, Result};
pub use time::TimeTag;

/// Protocol and configuration defaults
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default stream block size in samples per channel (10 ms at 48 kHz)
    pub const DEFAULT_BLOCK_SIZE: u32 = 480;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Default UDP port of a node
    pub const DEFAULT_UDP_PORT: u16 = 9998;

    /// Default TCP port of the rendezvous server
    pub const DEFAULT_SERVER_PORT: u16 = 10998;

    /// Housekeeping period of the node send thread
    pub const DEFAULT_NODE_TICK_MS: u32 = 5;

    /// Default maximum datagram size
    pub const DEFAULT_PACKET_SIZE: usize = 512;

    /// Largest datagram a node sends or receives
    pub const MAX_PACKET_SIZE: usize = 4096;

    /// Default jitter buffer size in milliseconds
    pub const DEFAULT_JITTER_BUFFER_MS: u32 = 50;

    /// Upper bound for automatic jitter buffer growth
    pub const MAX_JITTER_BUFFER_MS: u32 = 1000;

    pub const DEFAULT_RESEND_LIMIT: u32 = 16;
    pub const DEFAULT_RESEND_INTERVAL_MS: f64 = 10.0;

    /// Sent audio kept by a source for answering resend requests
    pub const DEFAULT_RESEND_BUFFER_MS: u32 = 1000;

    pub const DEFAULT_REDUNDANCY: u32 = 1;
    pub const DEFAULT_PING_INTERVAL_MS: u32 = 1000;

    pub const DEFAULT_SOURCE_TIMEOUT_MS: f64 = 10_000.0;
    pub const DEFAULT_INVITE_TIMEOUT_MS: f64 = 1000.0;
    pub const DEFAULT_FORMAT_TIMEOUT_MS: f64 = 1000.0;

    /// Blocks a sink waits for late arrivals before requesting a resend
    pub const DEFAULT_REORDER_WINDOW: u32 = 2;

    /// Bandwidth of the sample-rate DLL
    pub const DEFAULT_DLL_BANDWIDTH: f64 = 0.012;

    /// Fraction of a block period below which a tick counts as jitter
    pub const DEFAULT_DEJITTER_THRESHOLD: f64 = 0.75;

    /// Keep-alive interval of session clients
    pub const DEFAULT_CLIENT_PING_MS: u32 = 5000;

    /// Capacity of per-object event queues
    pub const EVENT_QUEUE_SIZE: usize = 256;

    /// Capacity of a source's outgoing packet queue
    pub const OUTGOING_QUEUE_SIZE: usize = 1024;
}
