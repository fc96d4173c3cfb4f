//! Relay Server
//!
//! Accepts terminal chat clients over TCP, composes everyone's video into a
//! per-client character grid and mixes everyone else's audio.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use term_relay::{config::AppConfig, server::Server, ui::WebServer, util::Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    tracing::info!(
        "Starting relay server (max {} clients, {} fps)",
        config.server.max_clients,
        config.server.video_fps
    );

    let shutdown = Shutdown::new();
    let server = Server::bind(&config, shutdown.clone())
        .with_context(|| format!("binding {}:{}", config.server.bind_address, config.server.port))?;
    let handle = server.spawn()?;

    if config.ui.enabled {
        let web = WebServer::new(&config.ui, handle.context().clone())?;
        tokio::spawn(async move {
            if let Err(e) = web.run().await {
                tracing::error!("Status API stopped: {}", e);
            }
        });
    }

    tracing::info!("Relay ready on {} - press Ctrl+C to stop", handle.addr());
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.trigger();

    tokio::task::spawn_blocking(move || handle.stop()).await??;
    Ok(())
}
