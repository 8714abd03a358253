//! Audio codecs
//!
//! Every stream format maps to one encoder/decoder pair. PCM is always
//! available; Opus needs the `opus` cargo feature (links libopus).

pub mod pcm;

#[cfg(feature = "opus")]
pub mod decoder;
#[cfg(feature = "opus")]
pub mod encoder;

use bytes::Bytes;

use crate::error::CodecError;
use crate::protocol::{CodecParams, Format};

pub use pcm::{PcmDecoder, PcmEncoder};

#[cfg(feature = "opus")]
pub use decoder::OpusDecoder;
#[cfg(feature = "opus")]
pub use encoder::OpusEncoder;

/// Turns one block of interleaved samples into a payload
pub trait AudioEncoder: Send {
    fn format(&self) -> &Format;

    /// `samples.len()` must be `block_size * channels`
    fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError>;

    fn frames_encoded(&self) -> u64;
}

/// Turns a payload back into interleaved samples
pub trait AudioDecoder: Send {
    fn format(&self) -> &Format;

    /// Decode into `out` (`block_size * channels` samples)
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<(), CodecError>;

    /// Fill `out` for a block that never arrived
    fn conceal(&mut self, out: &mut [f32]) -> Result<(), CodecError>;

    fn reset(&mut self);
}

pub fn create_encoder(format: &Format) -> Result<Box<dyn AudioEncoder>, CodecError> {
    format.validate().map_err(|e| CodecError::EncoderInit(e.to_string()))?;
    match format.codec {
        CodecParams::Pcm { .. } => Ok(Box::new(PcmEncoder::new(*format)?)),
        #[cfg(feature = "opus")]
        CodecParams::Opus { .. } => Ok(Box::new(OpusEncoder::new(*format)?)),
        #[cfg(not(feature = "opus"))]
        CodecParams::Opus { .. } => Err(CodecError::Unsupported("opus (built without the opus feature)".into())),
    }
}

pub fn create_decoder(format: &Format) -> Result<Box<dyn AudioDecoder>, CodecError> {
    format.validate().map_err(|e| CodecError::DecoderInit(e.to_string()))?;
    match format.codec {
        CodecParams::Pcm { .. } => Ok(Box::new(PcmDecoder::new(*format)?)),
        #[cfg(feature = "opus")]
        CodecParams::Opus { .. } => Ok(Box::new(OpusDecoder::new(*format)?)),
        #[cfg(not(feature = "opus"))]
        CodecParams::Opus { .. } => Err(CodecError::Unsupported("opus (built without the opus feature)".into())),
    }
}

/// Whether this build can stream `format`
pub fn is_supported(format: &Format) -> bool {
    match format.codec {
        CodecParams::Pcm { .. } => true,
        CodecParams::Opus { .. } => cfg!(feature = "opus"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BitDepth, Bitrate, Complexity, SignalType};

    #[test]
    fn test_factory() {
        let pcm = Format::pcm(2, 256, 44100, BitDepth::Int24);
        assert_eq!(create_encoder(&pcm).unwrap().format(), &pcm);
        assert_eq!(create_decoder(&pcm).unwrap().format(), &pcm);

        let invalid = Format::pcm(0, 256, 44100, BitDepth::Int24);
        assert!(create_encoder(&invalid).is_err());

        let opus = Format::opus(2, 480, 48000, Bitrate::Auto, Complexity::Auto, SignalType::Auto);
        assert_eq!(create_encoder(&opus).is_ok(), is_supported(&opus));
    }
}
