//! A 300 ms network stall grows an increase-only jitter buffer, which then
//! keeps its size for the rest of the stream.
//!
//! Datagrams are fed to the sink with explicit arrival times, so the time
//! line is exact.

use std::net::SocketAddr;

use aoo_transport::codec::{AudioEncoder, PcmEncoder};
use aoo_transport::config::{BufferMode, SinkConfig};
use aoo_transport::network::Endpoint;
use aoo_transport::protocol::{BitDepth, DataFrame, Format, StreamMessage};
use aoo_transport::stream::{Sink, StreamEvent};
use aoo_transport::TimeTag;

const SINK_ID: i32 = 1;
const SOURCE_ID: i32 = 4;
const STREAM_ID: i32 = 77;
const T0: f64 = 2000.0;
const PERIOD: f64 = 0.01;

/// Blocks 100..130 are held back and arrive together
const STALL_START: u32 = 100;
const STALL_BLOCKS: u32 = 30;

fn source_addr() -> SocketAddr {
    "127.0.0.1:7100".parse().unwrap()
}

fn at(t: f64) -> TimeTag {
    TimeTag::from_seconds(t)
}

fn format() -> Format {
    Format::pcm(1, 480, 48000, BitDepth::Float32)
}

struct Feed {
    encoder: PcmEncoder,
}

impl Feed {
    fn data(&mut self, sequence: u32) -> Vec<u8> {
        let payload = self.encoder.encode(&[0.1; 480]).unwrap();
        StreamMessage::Data(DataFrame {
            source_id: SOURCE_ID,
            stream_id: STREAM_ID,
            sequence,
            timestamp: at(T0 + sequence as f64 * PERIOD),
            sample_rate: 48000.0,
            channel_onset: 0,
            total_size: payload.len() as u32,
            frame_count: 1,
            frame_index: 0,
            payload,
        })
        .encode(SINK_ID)
        .to_vec()
    }
}

#[test]
fn test_stall_grows_buffer_without_shrinking() {
    let sink = Sink::new(
        SINK_ID,
        SinkConfig {
            buffer_ms: 50.0,
            buffer_mode: BufferMode::AutoIncreaseOnly,
            max_buffer_ms: 1000.0,
            resend_enabled: false,
            ..SinkConfig::default()
        },
    );
    sink.setup(48000, 480, 1);
    let endpoint = Endpoint::new(source_addr(), SOURCE_ID);

    let announce = StreamMessage::Format { source_id: SOURCE_ID, stream_id: STREAM_ID, format: format() };
    sink.handle_message_at(&announce.encode(SINK_ID), source_addr(), at(T0));

    let mut feed = Feed { encoder: PcmEncoder::new(format()).unwrap() };
    let mut output = vec![0.0f32; 480];
    let mut sizes = Vec::new();
    let mut events = Vec::new();

    // 10 s of stream with a stall in the second second
    for k in 0..1000u32 {
        let t = T0 + k as f64 * PERIOD;
        if k < STALL_START || k >= STALL_START + STALL_BLOCKS {
            sink.handle_message_at(&feed.data(k), source_addr(), at(t));
        }
        if k == STALL_START + STALL_BLOCKS - 1 {
            for held in STALL_START..STALL_START + STALL_BLOCKS {
                sink.handle_message_at(&feed.data(held), source_addr(), at(t));
            }
        }

        let mut outputs = [output.as_mut_slice()];
        sink.process(&mut outputs, at(t)).unwrap();
        events.extend(sink.poll_events());
        sizes.push(sink.source_info(endpoint).unwrap().buffer_ms);
    }

    assert_eq!(sizes[0], 50.0);
    assert!(sizes.windows(2).all(|w| w[1] >= w[0]), "buffer size decreased");
    let last = *sizes.last().unwrap();
    assert!(last >= 290.0, "buffer only grew to {} ms", last);
    assert!(last <= 1000.0);

    let resizes: Vec<(f64, f64)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::BufferResize { old_ms, new_ms, .. } => Some((*old_ms, *new_ms)),
            _ => None,
        })
        .collect();
    assert!(!resizes.is_empty());
    assert!(resizes.iter().all(|(old, new)| new > old));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Underrun { .. })));
}

#[test]
fn test_manual_size_is_kept_when_off() {
    let sink = Sink::new(SINK_ID, SinkConfig { buffer_ms: 50.0, buffer_mode: BufferMode::Off, ..SinkConfig::default() });
    sink.setup(48000, 480, 1);
    let endpoint = Endpoint::new(source_addr(), SOURCE_ID);

    let announce = StreamMessage::Format { source_id: SOURCE_ID, stream_id: STREAM_ID, format: format() };
    sink.handle_message_at(&announce.encode(SINK_ID), source_addr(), at(T0));
    let mut feed = Feed { encoder: PcmEncoder::new(format()).unwrap() };
    let mut output = vec![0.0f32; 480];

    for k in 0..200u32 {
        let t = T0 + k as f64 * PERIOD;
        // Every block arrives half a second late in bursts
        if k % 50 == 49 {
            for held in k - 49..=k {
                sink.handle_message_at(&feed.data(held), source_addr(), at(t));
            }
        }
        let mut outputs = [output.as_mut_slice()];
        sink.process(&mut outputs, at(t)).unwrap();
    }
    assert_eq!(sink.source_info(endpoint).unwrap().buffer_ms, 50.0);

    sink.set_buffer_size(120.0).unwrap();
    assert_eq!(sink.source_info(endpoint).unwrap().buffer_ms, 120.0);
}
