//! Stream formats and their wire representation
//!
//! ```text
//! [codec tag u8][channels u16][block size u32][sample rate u32][param len u16][params]
//!   pcm params:  [bit depth u8]
//!   opus params: [bitrate i32][complexity i8][signal u8]
//! ```

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::ensure;
use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::ProtocolError;

const CODEC_PCM: u8 = 0;
const CODEC_OPUS: u8 = 1;

/// Wire value of [`Bitrate::Auto`] (same as `OPUS_AUTO`)
const BITRATE_AUTO: i32 = -1000;
/// Wire value of [`Bitrate::Max`] (same as `OPUS_BITRATE_MAX`)
const BITRATE_MAX: i32 = -1;
const COMPLEXITY_AUTO: i8 = -1;

/// Upper limits a format must respect, so a datagram cannot make a sink
/// allocate arbitrary amounts of memory
pub const MAX_CHANNELS: u16 = 255;
pub const MAX_BLOCK_SIZE: u32 = 16384;
pub const MAX_SAMPLE_RATE: u32 = 384_000;
pub const MAX_COMPLEXITY: u8 = 10;

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitDepth {
    Int16,
    Int24,
    Float32,
    Float64,
}

impl BitDepth {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            BitDepth::Int16 => 2,
            BitDepth::Int24 => 3,
            BitDepth::Float32 => 4,
            BitDepth::Float64 => 8,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            BitDepth::Int16 => 2,
            BitDepth::Int24 => 3,
            BitDepth::Float32 => 4,
            BitDepth::Float64 => 8,
        }
    }

    fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            2 => BitDepth::Int16,
            3 => BitDepth::Int24,
            4 => BitDepth::Float32,
            8 => BitDepth::Float64,
            other => return Err(ProtocolError::InvalidFormat(format!("bit depth {}", other))),
        })
    }
}

/// Compressed bitrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bitrate {
    Auto,
    Max,
    /// Bits per second (all channels)
    Bits(u32),
}

impl Bitrate {
    fn to_wire(self) -> i32 {
        match self {
            Bitrate::Auto => BITRATE_AUTO,
            Bitrate::Max => BITRATE_MAX,
            Bitrate::Bits(bits) => bits.min(i32::MAX as u32) as i32,
        }
    }

    fn from_wire(value: i32) -> Result<Self, ProtocolError> {
        match value {
            BITRATE_AUTO => Ok(Bitrate::Auto),
            BITRATE_MAX => Ok(Bitrate::Max),
            bits if bits > 0 => Ok(Bitrate::Bits(bits as u32)),
            other => Err(ProtocolError::InvalidFormat(format!("bitrate {}", other))),
        }
    }
}

/// Encoder complexity, 0-10
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Auto,
    Level(u8),
}

impl Complexity {
    fn to_wire(self) -> i8 {
        match self {
            Complexity::Auto => COMPLEXITY_AUTO,
            Complexity::Level(level) => level.min(MAX_COMPLEXITY) as i8,
        }
    }

    fn from_wire(value: i8) -> Result<Self, ProtocolError> {
        match value {
            COMPLEXITY_AUTO => Ok(Complexity::Auto),
            0..=10 => Ok(Complexity::Level(value as u8)),
            other => Err(ProtocolError::InvalidFormat(format!("complexity {}", other))),
        }
    }
}

/// Signal type hint for the compressed codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    #[default]
    Auto,
    Music,
    Voice,
}

impl SignalType {
    fn to_wire(self) -> u8 {
        match self {
            SignalType::Auto => 0,
            SignalType::Music => 1,
            SignalType::Voice => 2,
        }
    }

    fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => SignalType::Auto,
            1 => SignalType::Music,
            2 => SignalType::Voice,
            other => return Err(ProtocolError::InvalidFormat(format!("signal type {}", other))),
        })
    }
}

/// Codec tag plus codec-specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecParams {
    Pcm { bit_depth: BitDepth },
    Opus { bitrate: Bitrate, complexity: Complexity, signal: SignalType },
}

/// Stream format negotiated between a source and a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Format {
    pub codec: CodecParams,
    pub channels: u16,
    /// Samples per channel in one stream block
    pub block_size: u32,
    pub sample_rate: u32,
}

impl Default for Format {
    fn default() -> Self {
        Self::pcm(DEFAULT_CHANNELS, DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_RATE, BitDepth::Float32)
    }
}

impl Format {
    pub fn pcm(channels: u16, block_size: u32, sample_rate: u32, bit_depth: BitDepth) -> Self {
        Self { codec: CodecParams::Pcm { bit_depth }, channels, block_size, sample_rate }
    }

    pub fn opus(
        channels: u16,
        block_size: u32,
        sample_rate: u32,
        bitrate: Bitrate,
        complexity: Complexity,
        signal: SignalType,
    ) -> Self {
        Self {
            codec: CodecParams::Opus { bitrate, complexity, signal },
            channels,
            block_size,
            sample_rate,
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self.codec {
            CodecParams::Pcm { .. } => "pcm",
            CodecParams::Opus { .. } => "opus",
        }
    }

    /// Duration of one block in seconds
    pub fn block_duration(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }

    /// Interleaved samples in one block
    pub fn samples_per_block(&self) -> usize {
        (self.block_size as usize).saturating_mul(self.channels as usize)
    }

    /// Largest encoded payload one block of this format can produce
    pub fn max_block_bytes(&self) -> usize {
        match self.codec {
            CodecParams::Pcm { bit_depth } => self.samples_per_block().saturating_mul(bit_depth.bytes_per_sample()),
            // Compressed blocks never exceed 16-bit PCM
            CodecParams::Opus { .. } => self.samples_per_block().saturating_mul(2),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ProtocolError::InvalidFormat(format!("{} channels", self.channels)));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ProtocolError::InvalidFormat(format!("block size {}", self.block_size)));
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(ProtocolError::InvalidFormat(format!("sample rate {}", self.sample_rate)));
        }
        if let CodecParams::Opus { bitrate, complexity, .. } = self.codec {
            if let Bitrate::Bits(bits) = bitrate {
                if bits == 0 || bits > i32::MAX as u32 {
                    return Err(ProtocolError::InvalidFormat(format!("bitrate {}", bits)));
                }
            }
            if let Complexity::Level(level) = complexity {
                if level > MAX_COMPLEXITY {
                    return Err(ProtocolError::InvalidFormat(format!("complexity {}", level)));
                }
            }
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(match self.codec {
            CodecParams::Pcm { .. } => CODEC_PCM,
            CodecParams::Opus { .. } => CODEC_OPUS,
        });
        buf.put_u16(self.channels);
        buf.put_u32(self.block_size);
        buf.put_u32(self.sample_rate);
        match self.codec {
            CodecParams::Pcm { bit_depth } => {
                buf.put_u16(1);
                buf.put_u8(bit_depth.to_wire());
            }
            CodecParams::Opus { bitrate, complexity, signal } => {
                buf.put_u16(6);
                buf.put_i32(bitrate.to_wire());
                buf.put_i8(complexity.to_wire());
                buf.put_u8(signal.to_wire());
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(&*buf, 13)?;
        let tag = buf.get_u8();
        let channels = buf.get_u16();
        let block_size = buf.get_u32();
        let sample_rate = buf.get_u32();
        let param_len = buf.get_u16() as usize;
        ensure(&*buf, param_len)?;
        let mut params = buf.copy_to_bytes(param_len);

        let codec = match tag {
            CODEC_PCM => {
                ensure(&params, 1)?;
                CodecParams::Pcm { bit_depth: BitDepth::from_wire(params.get_u8())? }
            }
            CODEC_OPUS => {
                ensure(&params, 6)?;
                let bitrate = Bitrate::from_wire(params.get_i32())?;
                let complexity = Complexity::from_wire(params.get_i8())?;
                let signal = SignalType::from_wire(params.get_u8())?;
                CodecParams::Opus { bitrate, complexity, signal }
            }
            other => return Err(ProtocolError::InvalidFormat(format!("codec tag {}", other))),
        };

        let format = Self { codec, channels, block_size, sample_rate };
        format.validate()?;
        Ok(format)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}ch {}Hz {}", self.codec_name(), self.channels, self.sample_rate, self.block_size)?;
        match self.codec {
            CodecParams::Pcm { bit_depth } => write!(f, " {:?}", bit_depth),
            CodecParams::Opus { bitrate, complexity, signal } => {
                write!(f, " {:?} {:?} {:?}", bitrate, complexity, signal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn roundtrip(format: &Format) -> Format {
        let mut buf = BytesMut::new();
        format.encode(&mut buf);
        let mut slice = &buf[..];
        let decoded = Format::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        decoded
    }

    #[test]
    fn test_sentinel_bitrates() {
        for bitrate in [Bitrate::Auto, Bitrate::Max, Bitrate::Bits(96_000)] {
            let f = Format::opus(2, 480, 48000, bitrate, Complexity::Auto, SignalType::Voice);
            assert_eq!(roundtrip(&f), f);
        }
    }

    #[test]
    fn test_unknown_params_are_skipped_by_length() {
        // A future encoder may append parameters; the length prefix bounds them.
        let f = Format::pcm(1, 64, 44100, BitDepth::Int24);
        let mut buf = BytesMut::new();
        f.encode(&mut buf);
        let len_pos = 1 + 2 + 4 + 4;
        buf[len_pos + 1] = 2;
        buf.put_u8(0xEE);
        buf.put_u8(0xFF);
        let mut slice = &buf[..];
        assert_eq!(Format::decode(&mut slice).unwrap(), f);
        assert_eq!(slice, &[0xFF]);
    }

    #[test]
    fn test_invalid_formats() {
        let mut buf = BytesMut::new();
        Format::pcm(0, 64, 44100, BitDepth::Int16).encode(&mut buf);
        assert!(Format::decode(&mut &buf[..]).is_err());

        let mut buf = BytesMut::new();
        Format::pcm(2, 64, 44100, BitDepth::Int16).encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] = 5;
        assert!(Format::decode(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_oversized_format_rejected() {
        let huge = Format::pcm(u16::MAX, u32::MAX, 48000, BitDepth::Float64);
        assert!(huge.validate().is_err());
        let mut buf = BytesMut::new();
        huge.encode(&mut buf);
        assert!(Format::decode(&mut &buf[..]).is_err());

        assert!(Format::pcm(2, 480, 10_000_000, BitDepth::Int16).validate().is_err());
        assert!(Format::pcm(MAX_CHANNELS, MAX_BLOCK_SIZE, MAX_SAMPLE_RATE, BitDepth::Int16).validate().is_ok());
        assert_eq!(Format::pcm(2, 480, 48000, BitDepth::Int24).max_block_bytes(), 2880);
    }

    #[test]
    fn test_unrepresentable_opus_params_rejected() {
        let opus = |bitrate, complexity| Format::opus(2, 480, 48000, bitrate, complexity, SignalType::Auto);
        assert!(opus(Bitrate::Bits(0), Complexity::Auto).validate().is_err());
        assert!(opus(Bitrate::Bits(i32::MAX as u32 + 1), Complexity::Auto).validate().is_err());
        assert!(opus(Bitrate::Auto, Complexity::Level(11)).validate().is_err());
        assert!(opus(Bitrate::Bits(i32::MAX as u32), Complexity::Level(10)).validate().is_ok());
    }

    fn arb_codec() -> impl Strategy<Value = CodecParams> {
        let pcm = prop_oneof![
            Just(BitDepth::Int16),
            Just(BitDepth::Int24),
            Just(BitDepth::Float32),
            Just(BitDepth::Float64)
        ]
        .prop_map(|bit_depth| CodecParams::Pcm { bit_depth });
        let bitrate = prop_oneof![
            Just(Bitrate::Auto),
            Just(Bitrate::Max),
            (1u32..=510_000).prop_map(Bitrate::Bits)
        ];
        let complexity = prop_oneof![Just(Complexity::Auto), (0u8..=10).prop_map(Complexity::Level)];
        let signal = prop_oneof![Just(SignalType::Auto), Just(SignalType::Music), Just(SignalType::Voice)];
        let opus = (bitrate, complexity, signal)
            .prop_map(|(bitrate, complexity, signal)| CodecParams::Opus { bitrate, complexity, signal });
        prop_oneof![pcm, opus]
    }

    /// Opus parameters including values the wire cannot carry
    fn arb_any_opus() -> impl Strategy<Value = CodecParams> {
        let bitrate = prop_oneof![Just(Bitrate::Auto), Just(Bitrate::Max), any::<u32>().prop_map(Bitrate::Bits)];
        let complexity = prop_oneof![Just(Complexity::Auto), any::<u8>().prop_map(Complexity::Level)];
        (bitrate, complexity).prop_map(|(bitrate, complexity)| CodecParams::Opus {
            bitrate,
            complexity,
            signal: SignalType::Auto,
        })
    }

    proptest! {
        #[test]
        fn prop_format_roundtrip(
            codec in arb_codec(),
            channels in 1u16..=64,
            block_size in 1u32..=8192,
            sample_rate in 1u32..=384_000,
        ) {
            let f = Format { codec, channels, block_size, sample_rate };
            prop_assert_eq!(roundtrip(&f), f);
        }

        #[test]
        fn prop_valid_formats_survive_the_wire(
            codec in arb_any_opus(),
            channels in 0u16..=300,
            block_size in 0u32..=20_000,
            sample_rate in 0u32..=400_000,
        ) {
            let f = Format { codec, channels, block_size, sample_rate };
            let mut buf = BytesMut::new();
            f.encode(&mut buf);
            let decoded = Format::decode(&mut &buf[..]);
            if f.validate().is_ok() {
                prop_assert_eq!(decoded.ok(), Some(f));
            } else {
                prop_assert!(decoded.map(|d| d != f).unwrap_or(true));
            }
        }
    }
}
