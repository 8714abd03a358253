//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment.

use opus::Decoder;

use super::encoder::{check_layout, opus_channels};
use super::AudioDecoder;
use crate::error::CodecError;
use crate::protocol::{CodecParams, Format};

/// Opus decoder for one stream format
pub struct OpusDecoder {
    decoder: Decoder,
    format: Format,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames lost (PLC used)
    frames_lost: u64,
}

impl OpusDecoder {
    pub fn new(format: Format) -> Result<Self, CodecError> {
        if !matches!(format.codec, CodecParams::Opus { .. }) {
            return Err(CodecError::DecoderInit(format!("not an Opus format: {}", format)));
        }
        check_layout(&format).map_err(CodecError::DecoderInit)?;
        let channels = opus_channels(format.channels).map_err(CodecError::DecoderInit)?;

        let decoder = Decoder::new(format.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self { decoder, format, frames_decoded: 0, frames_lost: 0 })
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_lost(&self) -> u64 {
        self.frames_lost
    }

    fn check_len(&self, decoded: usize, out: &[f32]) -> Result<(), CodecError> {
        if decoded * self.format.channels as usize != out.len() {
            return Err(CodecError::InvalidFrameSize(decoded));
        }
        Ok(())
    }
}

impl AudioDecoder for OpusDecoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<(), CodecError> {
        let samples = self
            .decoder
            .decode_float(data, out, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        self.frames_decoded += 1;
        self.check_len(samples, out)
    }

    /// Packet loss concealment
    fn conceal(&mut self, out: &mut [f32]) -> Result<(), CodecError> {
        let samples = self
            .decoder
            .decode_float(&[], out, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        self.frames_lost += 1;
        self.check_len(samples, out)
    }

    fn reset(&mut self) {
        if let Err(e) = self.decoder.reset_state() {
            tracing::warn!("Opus decoder reset failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioEncoder, OpusEncoder};
    use crate::protocol::{Bitrate, Complexity, SignalType};

    fn format() -> Format {
        Format::opus(2, 480, 48000, Bitrate::Auto, Complexity::Auto, SignalType::Music)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = OpusEncoder::new(format()).unwrap();
        let mut decoder = OpusDecoder::new(format()).unwrap();

        // Create test samples (sine wave)
        let frame_size = format().samples_per_block();
        let mut samples: Vec<f32> = Vec::with_capacity(frame_size);
        for i in 0..frame_size / 2 {
            let t = i as f32 / 48000.0;
            let val = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
            samples.push(val); // Left
            samples.push(val); // Right
        }

        let encoded = encoder.encode(&samples).unwrap();
        let mut decoded = vec![0.0f32; frame_size];
        decoder.decode(&encoded, &mut decoded).unwrap();
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn test_plc() {
        let mut decoder = OpusDecoder::new(format()).unwrap();
        let mut out = vec![0.0f32; format().samples_per_block()];
        decoder.conceal(&mut out).unwrap();
        assert_eq!(decoder.frames_lost(), 1);
    }
}
