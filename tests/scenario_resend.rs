//! Lost blocks are recovered by resend requests before they are played.
//!
//! The source streams to two sinks. A UDP relay in front of the first one
//! drops the first copy of a fixed set of data blocks. With a 200 ms buffer
//! every one of them must come back through a resend, and nothing may be
//! played as lost. The second sink sits on a clean path.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aoo_transport::config::{BufferMode, SinkConfig, SourceConfig};
use aoo_transport::network::{Endpoint, NodeRegistry};
use aoo_transport::protocol::stream::KIND_DATA;
use aoo_transport::protocol::{peek_header, BitDepth, Format, StreamMessage};
use aoo_transport::stream::{Sink, Source, StreamEvent};
use aoo_transport::TimeTag;

const SINK_ID: i32 = 7;
const BLOCKS: usize = 150;
const DROPPED: [u32; 9] = [10, 11, 25, 40, 41, 42, 60, 77, 89];

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Forwards between one source and one sink, dropping the first copy of
/// every block in `DROPPED`. Returns how many datagrams it dropped.
fn spawn_relay(socket: UdpSocket, sink: SocketAddr, stop: Arc<AtomicBool>) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 4096];
        let mut source: Option<SocketAddr> = None;
        let mut seen = HashSet::new();
        let mut dropped = 0;

        while !stop.load(Ordering::Acquire) {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => continue,
            };
            let packet = &buf[..len];
            if from.port() == sink.port() {
                if let Some(source) = source {
                    socket.send_to(packet, source).unwrap();
                }
                continue;
            }
            source = Some(from);

            let is_data = peek_header(packet).map(|h| h.kind == KIND_DATA).unwrap_or(false);
            if is_data {
                if let Ok((_, StreamMessage::Data(frame))) = StreamMessage::decode(packet) {
                    if DROPPED.contains(&frame.sequence) && seen.insert(frame.sequence) {
                        dropped += 1;
                        continue;
                    }
                }
            }
            socket.send_to(packet, sink).unwrap();
        }
        dropped
    })
}

#[test]
fn test_dropped_blocks_are_resent_in_time() {
    let registry = NodeRegistry::new();
    let format = Format::pcm(2, 480, 48000, BitDepth::Int16);

    let sink = Sink::new(
        SINK_ID,
        SinkConfig { buffer_ms: 200.0, buffer_mode: BufferMode::Off, ..SinkConfig::default() },
    );
    sink.setup(48000, 480, 2);
    let sink_port = sink.bind(&registry, 0).unwrap();

    let clean = Sink::new(SINK_ID + 1, SinkConfig { buffer_ms: 200.0, buffer_mode: BufferMode::Off, ..SinkConfig::default() });
    clean.setup(48000, 480, 2);
    let clean_port = clean.bind(&registry, 0).unwrap();

    let source = Source::new(1, SourceConfig { format, packet_size: 2048, redundancy: 1, ..SourceConfig::default() });
    source.setup(48000, 480, 2);
    source.bind(&registry, 0).unwrap();

    let relay = UdpSocket::bind(loopback(0)).unwrap();
    let relay_addr = loopback(relay.local_addr().unwrap().port());
    let stop = Arc::new(AtomicBool::new(false));
    let relay = spawn_relay(relay, loopback(sink_port), Arc::clone(&stop));

    source.add_sink(Endpoint::new(relay_addr, SINK_ID), 0);
    source.add_sink(Endpoint::new(loopback(clean_port), SINK_ID + 1), 0);

    let input: Vec<Vec<f32>> = (0..2).map(|c| (0..480).map(|i| ((i + c) as f32 * 0.01).sin()).collect()).collect();
    let mut output = vec![vec![0.0f32; 480]; 2];
    let mut clean_output = output.clone();
    let mut events = Vec::new();
    let mut clean_events = Vec::new();

    let period = Duration::from_millis(10);
    let mut deadline = Instant::now();
    for _ in 0..BLOCKS {
        let now = TimeTag::now();
        let inputs: Vec<&[f32]> = input.iter().map(|c| c.as_slice()).collect();
        source.process(&inputs, now).unwrap();

        let mut outputs: Vec<&mut [f32]> = output.iter_mut().map(|c| c.as_mut_slice()).collect();
        sink.process(&mut outputs, now).unwrap();
        events.extend(sink.poll_events());

        let mut outputs: Vec<&mut [f32]> = clean_output.iter_mut().map(|c| c.as_mut_slice()).collect();
        clean.process(&mut outputs, now).unwrap();
        clean_events.extend(clean.poll_events());

        deadline += period;
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    stop.store(true, Ordering::Release);
    let dropped = relay.join().unwrap();
    assert_eq!(dropped, DROPPED.len());

    let resent: u32 = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::BlockResent { count, .. } => Some(*count),
            _ => None,
        })
        .sum();
    assert_eq!(resent as usize, dropped);
    assert!(
        !events.iter().any(|e| matches!(e, StreamEvent::BlockLost { .. } | StreamEvent::BlockGap { .. })),
        "unexpected loss: {:?}",
        events
    );
    assert!(source.stats().blocks_resent >= dropped as u64);

    assert!(clean_events.iter().any(|e| matches!(e, StreamEvent::SourceAdd { .. })));
    assert!(
        !clean_events.iter().any(|e| matches!(
            e,
            StreamEvent::BlockResent { .. } | StreamEvent::BlockLost { .. } | StreamEvent::BlockGap { .. }
        )),
        "clean path saw loss: {:?}",
        clean_events
    );
}
