//! Demo sender
//!
//! Streams a test tone to one sink, paced like an audio callback.
//!
//! Usage: `sender [sink address] [sink id] [local port]`

use anyhow::{Context, Result};
use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aoo_transport::{
    clock::DejitterClock,
    config::AppConfig,
    network::{Endpoint, NodeRegistry},
    stream::{Source, StreamEvent},
};

fn main() -> Result<()> {
    let config = AppConfig::load_or_default();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AOO sender");

    let mut args = std::env::args().skip(1);
    let sink_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:9998".to_string())
        .parse()
        .context("Invalid sink address")?;
    let sink_id: i32 = args.next().map(|s| s.parse()).transpose().context("Invalid sink id")?.unwrap_or(1);
    let port: u16 = args.next().map(|s| s.parse()).transpose().context("Invalid port")?.unwrap_or(0);

    let format = config.source.format;
    let sample_rate = format.sample_rate;
    let block_size = format.block_size;
    let channels = format.channels as usize;

    let source = Source::new(1, config.source.clone());
    source.setup(sample_rate, block_size, channels);
    let port = source.bind(NodeRegistry::global(), port).context("Cannot open node")?;
    tracing::info!("Source bound to port {}, format {}", port, format);

    let sink = Endpoint::new(sink_addr, sink_id);
    source.add_sink(sink, 0);
    tracing::info!("Streaming to {}", sink);

    let mut clock = DejitterClock::new(sample_rate, block_size, &config.dejitter);
    let period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
    let mut block: Vec<Vec<f32>> = vec![vec![0.0; block_size as usize]; channels];
    let mut phase = 0.0f32;
    let step = TAU * 440.0 / sample_rate as f32;

    let start = Instant::now();
    let mut deadline = start;
    let mut last_stats = start;

    tracing::info!("Starting main loop - press Ctrl+C to stop");
    loop {
        for i in 0..block_size as usize {
            let sample = 0.25 * phase.sin();
            for channel in block.iter_mut() {
                channel[i] = sample;
            }
            phase = (phase + step) % TAU;
        }

        let now = clock.tick_now();
        let inputs: Vec<&[f32]> = block.iter().map(|c| c.as_slice()).collect();
        if let Err(e) = source.process(&inputs, now) {
            tracing::warn!("Process failed: {}", e);
        }

        for event in source.poll_events() {
            match event {
                StreamEvent::Ping { endpoint, rtt_ms, lost, .. } => {
                    tracing::debug!("Ping {}: rtt {:.2} ms, {} lost", endpoint, rtt_ms, lost)
                }
                StreamEvent::Invite { endpoint } => tracing::info!("Invitation from {}", endpoint),
                StreamEvent::Uninvite { endpoint } => tracing::info!("Uninvited by {}", endpoint),
                StreamEvent::CodecChange { endpoint, format } => {
                    tracing::info!("{} asked for {}", endpoint, format)
                }
                other => tracing::debug!("{:?}", other),
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(5) {
            last_stats = Instant::now();
            let stats = source.stats();
            tracing::info!("Stats: {}", serde_json::to_string(&stats).unwrap_or_default());
        }

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else if now - deadline > period * 10 {
            // Fell far behind, e.g. after a suspend
            deadline = now;
        }
    }
}
