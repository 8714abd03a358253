//! Session server
//!
//! Usage: `aoo-server [port] [password]`

use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aoo_transport::{
    config::AppConfig,
    session::{Server, ServerEvent},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load_or_default();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AOO session server");

    let mut server_config = config.server.clone();
    let mut args = std::env::args().skip(1);
    if let Some(port) = args.next() {
        server_config.port = port.parse().context("Invalid port")?;
    }
    if let Some(password) = args.next() {
        server_config.password = password;
    }

    let server = Server::bind(server_config).await.context("Cannot start server")?;
    let runner = server.clone();
    let run = tokio::spawn(async move { runner.run().await });

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in server.poll_events() {
                    match event {
                        ServerEvent::UserJoin { user, address, .. } => tracing::info!("+ {} ({})", user, address),
                        ServerEvent::UserLeave { user, .. } => tracing::info!("- {}", user),
                        other => tracing::debug!("{:?}", other),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    server.shutdown();
    run.await??;
    tracing::info!("{} users, {} groups at shutdown", server.user_count(), server.group_count());
    Ok(())
}
