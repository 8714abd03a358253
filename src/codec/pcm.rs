//! Uncompressed PCM codec
//!
//! Samples are interleaved and stored big-endian, like every other field
//! on the wire.

use bytes::{BufMut, Bytes, BytesMut};

use super::{AudioDecoder, AudioEncoder};
use crate::error::CodecError;
use crate::protocol::{BitDepth, CodecParams, Format};

const INT16_SCALE: f32 = 32767.0;
const INT24_SCALE: f32 = 8_388_607.0;

pub struct PcmEncoder {
    format: Format,
    bit_depth: BitDepth,
    frames_encoded: u64,
}

impl PcmEncoder {
    pub fn new(format: Format) -> Result<Self, CodecError> {
        match format.codec {
            CodecParams::Pcm { bit_depth } => Ok(Self { format, bit_depth, frames_encoded: 0 }),
            _ => Err(CodecError::EncoderInit(format!("not a PCM format: {}", format))),
        }
    }
}

impl AudioEncoder for PcmEncoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.format.samples_per_block() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }
        let mut buf = BytesMut::with_capacity(samples.len() * self.bit_depth.bytes_per_sample());
        match self.bit_depth {
            BitDepth::Int16 => {
                for s in samples {
                    buf.put_i16((s.clamp(-1.0, 1.0) * INT16_SCALE).round() as i16);
                }
            }
            BitDepth::Int24 => {
                for s in samples {
                    let v = (s.clamp(-1.0, 1.0) * INT24_SCALE).round() as i32;
                    buf.put_slice(&v.to_be_bytes()[1..]);
                }
            }
            BitDepth::Float32 => {
                for s in samples {
                    buf.put_f32(*s);
                }
            }
            BitDepth::Float64 => {
                for s in samples {
                    buf.put_f64(*s as f64);
                }
            }
        }
        self.frames_encoded += 1;
        Ok(buf.freeze())
    }

    fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

pub struct PcmDecoder {
    format: Format,
    bit_depth: BitDepth,
}

impl PcmDecoder {
    pub fn new(format: Format) -> Result<Self, CodecError> {
        match format.codec {
            CodecParams::Pcm { bit_depth } => Ok(Self { format, bit_depth }),
            _ => Err(CodecError::DecoderInit(format!("not a PCM format: {}", format))),
        }
    }
}

impl AudioDecoder for PcmDecoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<(), CodecError> {
        let width = self.bit_depth.bytes_per_sample();
        if data.len() != out.len() * width {
            return Err(CodecError::DecodingFailed(format!(
                "expected {} bytes, got {}",
                out.len() * width,
                data.len()
            )));
        }
        let chunks = data.chunks_exact(width);
        match self.bit_depth {
            BitDepth::Int16 => {
                for (o, c) in out.iter_mut().zip(chunks) {
                    *o = i16::from_be_bytes([c[0], c[1]]) as f32 / INT16_SCALE;
                }
            }
            BitDepth::Int24 => {
                for (o, c) in out.iter_mut().zip(chunks) {
                    // Sign-extend through the top byte
                    let v = i32::from_be_bytes([c[0], c[1], c[2], 0]) >> 8;
                    *o = v as f32 / INT24_SCALE;
                }
            }
            BitDepth::Float32 => {
                for (o, c) in out.iter_mut().zip(chunks) {
                    *o = f32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                }
            }
            BitDepth::Float64 => {
                for (o, c) in out.iter_mut().zip(chunks) {
                    *o = f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32;
                }
            }
        }
        Ok(())
    }

    fn conceal(&mut self, out: &mut [f32]) -> Result<(), CodecError> {
        out.fill(0.0);
        Ok(())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(format: &Format) -> Vec<f32> {
        let n = format.samples_per_block();
        (0..n).map(|i| (i as f32 / n as f32) * 2.0 - 1.0).collect()
    }

    #[test]
    fn test_all_bit_depths() {
        for (depth, tolerance) in [
            (BitDepth::Int16, 1.0 / 16000.0),
            (BitDepth::Int24, 1.0 / 4_000_000.0),
            (BitDepth::Float32, 0.0),
            (BitDepth::Float64, 0.0),
        ] {
            let format = Format::pcm(2, 64, 48000, depth);
            let input = ramp(&format);
            let mut encoder = PcmEncoder::new(format).unwrap();
            let mut decoder = PcmDecoder::new(format).unwrap();

            let encoded = encoder.encode(&input).unwrap();
            assert_eq!(encoded.len(), input.len() * depth.bytes_per_sample());

            let mut output = vec![0.0f32; input.len()];
            decoder.decode(&encoded, &mut output).unwrap();
            for (a, b) in input.iter().zip(&output) {
                assert!((a - b).abs() <= tolerance, "{:?}: {} vs {}", depth, a, b);
            }
        }
    }

    #[test]
    fn test_clipping() {
        let format = Format::pcm(1, 2, 48000, BitDepth::Int16);
        let mut encoder = PcmEncoder::new(format).unwrap();
        let encoded = encoder.encode(&[2.0, -2.0]).unwrap();
        assert_eq!(&encoded[..], &[0x7F, 0xFF, 0x80, 0x01]);
    }

    #[test]
    fn test_wrong_sizes() {
        let format = Format::pcm(2, 4, 48000, BitDepth::Float32);
        let mut encoder = PcmEncoder::new(format).unwrap();
        assert!(matches!(encoder.encode(&[0.0; 3]), Err(CodecError::InvalidFrameSize(3))));

        let mut decoder = PcmDecoder::new(format).unwrap();
        let mut out = [0.0f32; 8];
        assert!(decoder.decode(&[0u8; 5], &mut out).is_err());
    }
}
