//! Configuration for nodes, streams and the session layer
//!
//! Every section derives serde with `#[serde(default)]`, so a TOML file
//! only needs to name the values it changes.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Error;
use crate::protocol::Format;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub dejitter: DejitterConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from the per-user config directory, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => match Self::load(&path) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Ignoring invalid configuration {}: {}", path.display(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }

    /// Write as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// `<config dir>/config.toml` for this application
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "aoo", "aoo-transport").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Socket multiplexer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UDP port (0 picks an ephemeral port)
    pub port: u16,
    /// Bind to IPv6 (dual stack) instead of IPv4
    pub ipv6: bool,
    /// Period of the send loop's housekeeping tick
    pub tick_interval_ms: u32,
    /// Kernel socket buffer sizes (0 keeps the OS default)
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_UDP_PORT,
            ipv6: false,
            tick_interval_ms: DEFAULT_NODE_TICK_MS,
            send_buffer_size: 0,
            recv_buffer_size: 0,
        }
    }
}

/// Outgoing stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Format used for sinks without an individual format
    pub format: Format,
    /// Maximum datagram size; larger blocks are split into frames
    pub packet_size: usize,
    /// How many times each frame is sent
    pub redundancy: u32,
    /// How much sent audio is kept for answering resend requests
    pub resend_buffer_ms: u32,
    pub ping_interval_ms: u32,
    /// Bandwidth of the sample-rate estimating DLL
    pub dll_bandwidth: f64,
    /// Add sinks that invite themselves without asking the application
    pub auto_accept_invites: bool,
    /// Apply codec change requests from sinks without asking the application
    pub accept_codec_change: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            format: Format::default(),
            packet_size: DEFAULT_PACKET_SIZE,
            redundancy: DEFAULT_REDUNDANCY,
            resend_buffer_ms: DEFAULT_RESEND_BUFFER_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            dll_bandwidth: DEFAULT_DLL_BANDWIDTH,
            auto_accept_invites: true,
            accept_codec_change: true,
        }
    }
}

/// Jitter buffer sizing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    /// Size only changes through `set_buffer_size`
    Off,
    /// Grow on sustained loss, never shrink
    AutoIncreaseOnly,
    /// Grow on loss, shrink back towards the observed jitter when quiet
    #[default]
    AutoFull,
    /// Size once from the first seconds of the stream, then freeze
    InitAuto,
}

/// Incoming stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Jitter buffer size
    pub buffer_ms: f64,
    pub buffer_mode: BufferMode,
    /// Upper bound for automatic growth
    pub max_buffer_ms: f64,
    pub packet_size: usize,
    pub resend_enabled: bool,
    /// Maximum outstanding resend requests, and attempts per missing block
    pub resend_limit: u32,
    /// Minimum spacing between requests for the same block
    pub resend_interval_ms: f64,
    /// Blocks that may arrive out of order before a hole counts as missing
    pub reorder_window: u32,
    pub source_timeout_ms: f64,
    pub invite_timeout_ms: f64,
    pub format_timeout_ms: f64,
    /// Fade in the first block after a discontinuity
    pub fade_in: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_ms: DEFAULT_JITTER_BUFFER_MS as f64,
            buffer_mode: BufferMode::default(),
            max_buffer_ms: MAX_JITTER_BUFFER_MS as f64,
            packet_size: DEFAULT_PACKET_SIZE,
            resend_enabled: true,
            resend_limit: DEFAULT_RESEND_LIMIT,
            resend_interval_ms: DEFAULT_RESEND_INTERVAL_MS,
            reorder_window: DEFAULT_REORDER_WINDOW,
            source_timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            invite_timeout_ms: DEFAULT_INVITE_TIMEOUT_MS,
            format_timeout_ms: DEFAULT_FORMAT_TIMEOUT_MS,
            fade_in: true,
        }
    }
}

/// Session client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Keep-alive ping towards the server
    pub ping_interval_ms: u32,
    pub connect_timeout_ms: u32,
    /// Drop scheduled messages that arrive after their delivery time
    pub discard_late: bool,
    /// Size of the inbound scheduled message queue
    pub max_scheduled: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: DEFAULT_CLIENT_PING_MS,
            connect_timeout_ms: 5_000,
            discard_late: false,
            max_scheduled: 1024,
        }
    }
}

/// Rendezvous server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Empty means no server password
    pub password: String,
    /// Clients silent for longer than this are dropped
    pub client_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            password: String::new(),
            client_timeout_ms: 30_000,
        }
    }
}

/// Virtual clock smoothing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DejitterConfig {
    /// A tick whose raw interval is below `threshold * period` is treated as
    /// scheduler jitter rather than real elapsed time
    pub threshold: f64,
    /// Jitter offset (in block periods) after which the clock resyncs to the raw time
    pub max_offset_periods: f64,
}

impl Default for DejitterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DEJITTER_THRESHOLD,
            max_offset_periods: 16.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}
