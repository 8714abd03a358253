//! Demo receiver
//!
//! Plays incoming streams into a discarded buffer and prints per-source
//! statistics as JSON lines. Optionally logs in to a session server and
//! invites the sources of every peer that joins.
//!
//! Usage: `receiver [local port] [sink id] [server host:port user group]`

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aoo_transport::{
    clock::DejitterClock,
    config::AppConfig,
    network::{Endpoint, NodeRegistry},
    session::{Client, SessionEvent},
    stream::{Sink, StreamEvent},
};

/// Source id the demo sender uses
const PEER_SOURCE_ID: i32 = 1;

fn main() -> Result<()> {
    let config = AppConfig::load_or_default();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AOO receiver");

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().map(|s| s.parse()).transpose().context("Invalid port")?.unwrap_or(config.node.port);
    let sink_id: i32 = args.next().map(|s| s.parse()).transpose().context("Invalid sink id")?.unwrap_or(1);
    let server = args.next();
    let user = args.next().unwrap_or_else(|| "receiver".to_string());
    let group = args.next().unwrap_or_else(|| "demo".to_string());

    let format = config.source.format;
    let (sample_rate, block_size) = (format.sample_rate, format.block_size);
    let channels = format.channels as usize;

    let registry = NodeRegistry::global();
    let sink = Sink::new(sink_id, config.sink.clone());
    sink.setup(sample_rate, block_size, channels);
    let port = sink.bind(registry, port).context("Cannot open node")?;
    tracing::info!("Sink {} listening on port {}", sink_id, port);

    // The client shares the sink's node so peers see one address
    let client = Client::new(config.client.clone());
    if let Some(server) = server {
        let (host, server_port) = server.rsplit_once(':').context("Server must be host:port")?;
        let server_port: u16 = server_port.parse().context("Invalid server port")?;
        client.bind(registry, port).context("Cannot share node")?;
        let user_id = client
            .connect(host, server_port, &user, "")
            .wait_timeout(Duration::from_secs(10))
            .context("Login failed")?;
        tracing::info!("Logged in as {} (id {})", user, user_id);
        client.join_group(&group, "").wait_timeout(Duration::from_secs(10)).context("Join failed")?;
    }

    let mut clock = DejitterClock::new(sample_rate, block_size, &config.dejitter);
    let period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
    let mut block: Vec<Vec<f32>> = vec![vec![0.0; block_size as usize]; channels];

    let start = Instant::now();
    let mut deadline = start;
    let mut last_stats = start;

    tracing::info!("Waiting for audio streams...");
    loop {
        let now = clock.tick_now();
        let mut outputs: Vec<&mut [f32]> = block.iter_mut().map(|c| c.as_mut_slice()).collect();
        if let Err(e) = sink.process(&mut outputs, now) {
            tracing::warn!("Process failed: {}", e);
        }
        client.process(now);

        for event in client.poll_events() {
            match event {
                SessionEvent::PeerJoin(peer) => {
                    tracing::info!("Inviting source of {}", peer.label());
                    sink.invite_source(Endpoint::new(peer.address, PEER_SOURCE_ID));
                }
                SessionEvent::PeerLeave(peer) => {
                    sink.uninvite_source(Endpoint::new(peer.address, PEER_SOURCE_ID));
                }
                SessionEvent::Disconnected { error: Some(error) } => tracing::warn!("Session lost: {}", error),
                other => tracing::debug!("{:?}", other),
            }
        }

        for event in sink.poll_events() {
            match event {
                StreamEvent::SourceAdd { endpoint } => tracing::info!("New source {}", endpoint),
                StreamEvent::SourceRemove { endpoint } => tracing::info!("Source {} gone", endpoint),
                StreamEvent::FormatChange { endpoint, format } => {
                    tracing::info!("Source {} streams {}", endpoint, format)
                }
                StreamEvent::BufferResize { endpoint, old_ms, new_ms } => {
                    tracing::info!("Buffer for {}: {:.1} ms -> {:.1} ms", endpoint, old_ms, new_ms)
                }
                other => tracing::debug!("{:?}", other),
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(5) {
            last_stats = Instant::now();
            for info in sink.sources() {
                println!("{}", serde_json::to_string(&info)?);
            }
        }

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else if now - deadline > period * 10 {
            deadline = now;
        }
    }
}
