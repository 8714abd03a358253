//! Opus encoder wrapper
//!
//! Maps a stream [`Format`] onto an Opus encoder. Opus only accepts 8, 12,
//! 16, 24 or 48 kHz, one or two channels and frames of 2.5 to 60 ms, so
//! formats outside that range fail at creation.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use super::AudioEncoder;
use crate::error::CodecError;
use crate::protocol::{Bitrate, CodecParams, Format, SignalType};

/// Largest packet libopus produces for one frame
const MAX_OPUS_PACKET: usize = 4000;

/// Opus encoder for one stream format
pub struct OpusEncoder {
    encoder: Encoder,
    format: Format,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(format: Format) -> Result<Self, CodecError> {
        let (bitrate, signal) = match format.codec {
            CodecParams::Opus { bitrate, signal, .. } => (bitrate, signal),
            _ => return Err(CodecError::EncoderInit(format!("not an Opus format: {}", format))),
        };
        check_layout(&format).map_err(CodecError::EncoderInit)?;

        let channels = opus_channels(format.channels).map_err(CodecError::EncoderInit)?;

        // The signal hint picks the encoder application
        let application = match signal {
            SignalType::Voice => Application::Voip,
            SignalType::Music | SignalType::Auto => Application::Audio,
        };

        let mut encoder = Encoder::new(format.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        let bitrate = match bitrate {
            Bitrate::Auto => opus::Bitrate::Auto,
            Bitrate::Max => opus::Bitrate::Max,
            Bitrate::Bits(bits) => opus::Bitrate::Bits(bits.min(i32::MAX as u32) as i32),
        };
        encoder
            .set_bitrate(bitrate)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        Ok(Self {
            encoder,
            format,
            encode_buffer: vec![0u8; MAX_OPUS_PACKET],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Average payload size so far
    pub fn average_frame_size(&self) -> f32 {
        if self.frames_encoded > 0 {
            self.bytes_produced as f32 / self.frames_encoded as f32
        } else {
            0.0
        }
    }
}

impl AudioEncoder for OpusEncoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.format.samples_per_block() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

pub(crate) fn opus_channels(channels: u16) -> Result<Channels, String> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(format!("Unsupported channel count: {}", channels)),
    }
}

/// Sample rate and frame size restrictions of libopus
pub(crate) fn check_layout(format: &Format) -> Result<(), String> {
    if ![8000, 12000, 16000, 24000, 48000].contains(&format.sample_rate) {
        return Err(format!("Unsupported sample rate: {}", format.sample_rate));
    }
    // 2.5, 5, 10, 20, 40 or 60 ms
    let per_2_5ms = format.sample_rate / 400;
    let valid = [1, 2, 4, 8, 16, 24].iter().any(|n| n * per_2_5ms == format.block_size);
    if !valid {
        return Err(format!("Unsupported frame size: {}", format.block_size));
    }
    Ok(())
}
