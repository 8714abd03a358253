//! Source/sink stream messages
//!
//! Messages towards a sink carry the sink id in the routing header and the
//! sending source id in the body, and vice versa.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ensure, peek_header, EndpointType, Header, HEADER_SIZE};
use crate::constants::MAX_PACKET_SIZE;
use crate::error::ProtocolError;
use crate::protocol::Format;
use crate::time::TimeTag;

/// Message kinds addressed to sinks
pub const KIND_FORMAT: u8 = 1;
pub const KIND_DATA: u8 = 2;
pub const KIND_PING: u8 = 3;

/// Message kinds addressed to sources
pub const KIND_FORMAT_REQUEST: u8 = 10;
pub const KIND_RESEND_REQUEST: u8 = 11;
pub const KIND_PING_REPLY: u8 = 12;
pub const KIND_INVITE: u8 = 13;
pub const KIND_UNINVITE: u8 = 14;
pub const KIND_CODEC_CHANGE: u8 = 15;

/// Fixed part of a data message, header included
pub const DATA_HEADER_SIZE: usize = 47;

const DATA_ONSET_OFFSET: usize = 35;

/// Most sequence numbers one resend request may name
pub const MAX_RESEND_PER_REQUEST: usize = 64;

/// One frame of an encoded stream block
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub source_id: i32,
    /// Changes whenever the source restarts or changes format
    pub stream_id: i32,
    pub sequence: u32,
    /// Time of the first sample of the block
    pub timestamp: TimeTag,
    /// Sample rate measured by the source
    pub sample_rate: f64,
    /// First sink channel this stream is written to
    pub channel_onset: u16,
    /// Size of the complete encoded block
    pub total_size: u32,
    pub frame_count: u16,
    pub frame_index: u16,
    pub payload: Bytes,
}

/// Decoded stream message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    // source -> sink
    Format { source_id: i32, stream_id: i32, format: Format },
    Data(DataFrame),
    Ping { source_id: i32, sent: TimeTag },

    // sink -> source
    FormatRequest { sink_id: i32 },
    ResendRequest { sink_id: i32, stream_id: i32, sequences: Vec<u32> },
    PingReply { sink_id: i32, sent: TimeTag, received: TimeTag, lost: u32 },
    Invite { sink_id: i32 },
    Uninvite { sink_id: i32 },
    CodecChange { sink_id: i32, format: Format },
}

impl StreamMessage {
    pub fn kind(&self) -> u8 {
        match self {
            StreamMessage::Format { .. } => KIND_FORMAT,
            StreamMessage::Data(_) => KIND_DATA,
            StreamMessage::Ping { .. } => KIND_PING,
            StreamMessage::FormatRequest { .. } => KIND_FORMAT_REQUEST,
            StreamMessage::ResendRequest { .. } => KIND_RESEND_REQUEST,
            StreamMessage::PingReply { .. } => KIND_PING_REPLY,
            StreamMessage::Invite { .. } => KIND_INVITE,
            StreamMessage::Uninvite { .. } => KIND_UNINVITE,
            StreamMessage::CodecChange { .. } => KIND_CODEC_CHANGE,
        }
    }

    /// Endpoint type the message is routed to
    pub fn recipient_type(&self) -> EndpointType {
        match self {
            StreamMessage::Format { .. } | StreamMessage::Data(_) | StreamMessage::Ping { .. } => {
                EndpointType::Sink
            }
            _ => EndpointType::Source,
        }
    }

    /// Serialize with a routing header addressed to `recipient_id`
    pub fn encode(&self, recipient_id: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        Header::new(self.recipient_type(), recipient_id, self.kind()).encode(&mut buf);

        match self {
            StreamMessage::Format { source_id, stream_id, format } => {
                buf.put_i32(*source_id);
                buf.put_i32(*stream_id);
                format.encode(&mut buf);
            }
            StreamMessage::Data(frame) => {
                buf.put_i32(frame.source_id);
                buf.put_i32(frame.stream_id);
                buf.put_u32(frame.sequence);
                buf.put_u64(frame.timestamp.raw());
                buf.put_f64(frame.sample_rate);
                buf.put_u16(frame.channel_onset);
                buf.put_u32(frame.total_size);
                buf.put_u16(frame.frame_count);
                buf.put_u16(frame.frame_index);
                buf.put_u16(frame.payload.len() as u16);
                buf.put_slice(&frame.payload);
            }
            StreamMessage::Ping { source_id, sent } => {
                buf.put_i32(*source_id);
                buf.put_u64(sent.raw());
            }
            StreamMessage::FormatRequest { sink_id }
            | StreamMessage::Invite { sink_id }
            | StreamMessage::Uninvite { sink_id } => {
                buf.put_i32(*sink_id);
            }
            StreamMessage::ResendRequest { sink_id, stream_id, sequences } => {
                let count = sequences.len().min(MAX_RESEND_PER_REQUEST);
                buf.put_i32(*sink_id);
                buf.put_i32(*stream_id);
                buf.put_u16(count as u16);
                for seq in &sequences[..count] {
                    buf.put_u32(*seq);
                }
            }
            StreamMessage::PingReply { sink_id, sent, received, lost } => {
                buf.put_i32(*sink_id);
                buf.put_u64(sent.raw());
                buf.put_u64(received.raw());
                buf.put_u32(*lost);
            }
            StreamMessage::CodecChange { sink_id, format } => {
                buf.put_i32(*sink_id);
                format.encode(&mut buf);
            }
        }
        buf.freeze()
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            StreamMessage::Data(frame) => DATA_HEADER_SIZE + frame.payload.len(),
            StreamMessage::ResendRequest { sequences, .. } => HEADER_SIZE + 10 + sequences.len() * 4,
            _ => HEADER_SIZE + 32,
        }
    }

    /// Parse a complete datagram
    pub fn decode(data: &[u8]) -> Result<(Header, StreamMessage), ProtocolError> {
        let header = peek_header(data)?;
        let mut buf = &data[HEADER_SIZE..];

        let message = match (header.recipient, header.kind) {
            (EndpointType::Sink, KIND_FORMAT) => {
                ensure(&buf, 8)?;
                let source_id = buf.get_i32();
                let stream_id = buf.get_i32();
                let format = Format::decode(&mut buf)?;
                StreamMessage::Format { source_id, stream_id, format }
            }
            (EndpointType::Sink, KIND_DATA) => {
                ensure(&buf, DATA_HEADER_SIZE - HEADER_SIZE)?;
                let source_id = buf.get_i32();
                let stream_id = buf.get_i32();
                let sequence = buf.get_u32();
                let timestamp = TimeTag::from_raw(buf.get_u64());
                let sample_rate = buf.get_f64();
                let channel_onset = buf.get_u16();
                let total_size = buf.get_u32();
                let frame_count = buf.get_u16();
                let frame_index = buf.get_u16();
                let len = buf.get_u16() as usize;
                ensure(&buf, len)?;
                if frame_count == 0 || frame_index >= frame_count {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "frame {} of {}",
                        frame_index, frame_count
                    )));
                }
                // The frame must fit in its block, and the block in its frames
                let total = total_size as usize;
                if total > frame_count as usize * MAX_PACKET_SIZE {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "block of {} bytes in {} frames",
                        total, frame_count
                    )));
                }
                let offset = frame_index as usize * total.div_ceil(frame_count as usize).max(1);
                if offset + len > total {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "frame {} ({} bytes) outside block of {} bytes",
                        frame_index, len, total
                    )));
                }
                let payload = Bytes::copy_from_slice(&buf[..len]);
                StreamMessage::Data(DataFrame {
                    source_id,
                    stream_id,
                    sequence,
                    timestamp,
                    sample_rate,
                    channel_onset,
                    total_size,
                    frame_count,
                    frame_index,
                    payload,
                })
            }
            (EndpointType::Sink, KIND_PING) => {
                ensure(&buf, 12)?;
                let source_id = buf.get_i32();
                let sent = TimeTag::from_raw(buf.get_u64());
                StreamMessage::Ping { source_id, sent }
            }
            (EndpointType::Source, KIND_FORMAT_REQUEST) => {
                ensure(&buf, 4)?;
                StreamMessage::FormatRequest { sink_id: buf.get_i32() }
            }
            (EndpointType::Source, KIND_RESEND_REQUEST) => {
                ensure(&buf, 10)?;
                let sink_id = buf.get_i32();
                let stream_id = buf.get_i32();
                let count = buf.get_u16() as usize;
                ensure(&buf, count * 4)?;
                let sequences = (0..count).map(|_| buf.get_u32()).collect();
                StreamMessage::ResendRequest { sink_id, stream_id, sequences }
            }
            (EndpointType::Source, KIND_PING_REPLY) => {
                ensure(&buf, 24)?;
                let sink_id = buf.get_i32();
                let sent = TimeTag::from_raw(buf.get_u64());
                let received = TimeTag::from_raw(buf.get_u64());
                let lost = buf.get_u32();
                StreamMessage::PingReply { sink_id, sent, received, lost }
            }
            (EndpointType::Source, KIND_INVITE) => {
                ensure(&buf, 4)?;
                StreamMessage::Invite { sink_id: buf.get_i32() }
            }
            (EndpointType::Source, KIND_UNINVITE) => {
                ensure(&buf, 4)?;
                StreamMessage::Uninvite { sink_id: buf.get_i32() }
            }
            (EndpointType::Source, KIND_CODEC_CHANGE) => {
                ensure(&buf, 4)?;
                let sink_id = buf.get_i32();
                let format = Format::decode(&mut buf)?;
                StreamMessage::CodecChange { sink_id, format }
            }
            (_, kind) => return Err(ProtocolError::UnknownMessage(kind)),
        };
        Ok((header, message))
    }
}

/// Rewrite the per-sink fields of an encoded data message in place.
///
/// The source encodes each block once per format and only changes the
/// recipient id and channel onset for each sink it fans out to.
pub fn patch_data_recipient(packet: &mut [u8], sink_id: i32, channel_onset: u16) {
    if packet.len() < DATA_HEADER_SIZE {
        return;
    }
    packet[2..6].copy_from_slice(&sink_id.to_be_bytes());
    packet[DATA_ONSET_OFFSET..DATA_ONSET_OFFSET + 2].copy_from_slice(&channel_onset.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BitDepth, Bitrate, Complexity, SignalType};

    fn frame(payload: &'static [u8]) -> DataFrame {
        DataFrame {
            source_id: 3,
            stream_id: 77,
            sequence: 1234,
            timestamp: TimeTag::from_seconds(1000.5),
            sample_rate: 48000.25,
            channel_onset: 0,
            total_size: payload.len() as u32,
            frame_count: 1,
            frame_index: 0,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_data_layout() {
        let bytes = StreamMessage::Data(frame(b"abcd")).encode(9);
        assert_eq!(bytes.len(), DATA_HEADER_SIZE + 4);
        let (header, msg) = StreamMessage::decode(&bytes).unwrap();
        assert_eq!(header.recipient, EndpointType::Sink);
        assert_eq!(header.id, 9);
        assert_eq!(msg, StreamMessage::Data(frame(b"abcd")));
    }

    #[test]
    fn test_data_size_must_match_frames() {
        let mut huge = frame(b"abcd");
        huge.total_size = u32::MAX;
        assert!(StreamMessage::decode(&StreamMessage::Data(huge).encode(9)).is_err());

        let mut short = frame(b"abcd");
        short.total_size = 2;
        assert!(StreamMessage::decode(&StreamMessage::Data(short).encode(9)).is_err());

        // Last of three frames of a 10 byte block starts at byte 8
        let mut tail = frame(b"ab");
        tail.total_size = 10;
        tail.frame_count = 3;
        tail.frame_index = 2;
        assert!(StreamMessage::decode(&StreamMessage::Data(tail.clone()).encode(9)).is_ok());
        tail.payload = Bytes::from_static(b"abc");
        assert!(StreamMessage::decode(&StreamMessage::Data(tail).encode(9)).is_err());
    }

    #[test]
    fn test_patch_recipient() {
        let mut bytes = StreamMessage::Data(frame(b"xy")).encode(1).to_vec();
        patch_data_recipient(&mut bytes, 42, 6);
        let (header, msg) = StreamMessage::decode(&bytes).unwrap();
        assert_eq!(header.id, 42);
        match msg {
            StreamMessage::Data(f) => {
                assert_eq!(f.channel_onset, 6);
                assert_eq!(f.sequence, 1234);
                assert_eq!(&f.payload[..], b"xy");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_source_messages() {
        let format = Format::opus(2, 480, 48000, Bitrate::Max, Complexity::Level(5), SignalType::Music);
        let messages = vec![
            StreamMessage::FormatRequest { sink_id: 1 },
            StreamMessage::ResendRequest { sink_id: 1, stream_id: 2, sequences: vec![5, 6, 9] },
            StreamMessage::PingReply {
                sink_id: 1,
                sent: TimeTag::from_seconds(10.0),
                received: TimeTag::from_seconds(10.01),
                lost: 3,
            },
            StreamMessage::Invite { sink_id: 1 },
            StreamMessage::Uninvite { sink_id: 1 },
            StreamMessage::CodecChange { sink_id: 1, format },
        ];
        for msg in messages {
            let bytes = msg.encode(5);
            let (header, decoded) = StreamMessage::decode(&bytes).unwrap();
            assert_eq!(header.recipient, EndpointType::Source);
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_sink_messages() {
        let format = Format::pcm(1, 128, 44100, BitDepth::Int16);
        for msg in [
            StreamMessage::Format { source_id: 4, stream_id: 8, format },
            StreamMessage::Ping { source_id: 4, sent: TimeTag::from_seconds(3.5) },
        ] {
            let (_, decoded) = StreamMessage::decode(&msg.encode(0)).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let bytes = StreamMessage::Data(frame(b"abcdef")).encode(9);
        assert!(matches!(
            StreamMessage::decode(&bytes[..bytes.len() - 2]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(StreamMessage::decode(&bytes[..20]).is_err());
    }

    #[test]
    fn test_kind_must_match_recipient() {
        let mut bytes = StreamMessage::Invite { sink_id: 1 }.encode(0).to_vec();
        bytes[1] = EndpointType::Sink as u8;
        assert_eq!(StreamMessage::decode(&bytes), Err(ProtocolError::UnknownMessage(KIND_INVITE)));
    }
}
