//! Relay Client
//!
//! Streams a local video source and microphone to the relay and draws the
//! composed grid it sends back.
//!
//! Usage: `relay-client [config.toml] [--list-devices]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use term_relay::{
    audio::{list_devices, AudioEngine, CpalBackend},
    client::{terminal_size, Client, ConnectionHandle, TerminalSink},
    config::AppConfig,
    util::Shutdown,
    video::TestPattern,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Frames own stdout; logs go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        if arg == "--list-devices" {
            print_devices();
            return Ok(());
        }
        config_path = Some(PathBuf::from(arg));
    }
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    let size = terminal_size();
    tracing::info!(
        "Connecting to {}:{} as {:?} ({}x{})",
        config.client.server_address,
        config.client.port,
        config.client.display_name,
        size.width,
        size.height
    );

    let shutdown = Shutdown::new();
    let handle = ConnectionHandle::new(size);
    let mut client = Client::new(
        config.client.clone(),
        &config.audio,
        handle,
        Box::new(TerminalSink::stdout()),
        shutdown.clone(),
    );

    if config.client.send_video {
        client = client.with_video(Box::new(TestPattern::new(
            config.video.width,
            config.video.height,
            config.video.fps,
        )));
    }

    // The engine owns the device streams and must outlive the client.
    let mut engine = if config.client.send_audio && config.audio.enabled {
        match AudioEngine::start(&config.audio, Box::new(CpalBackend::new()), None) {
            Ok(engine) => {
                tracing::info!("Audio engine running in {:?} mode", engine.mode());
                Some(engine)
            }
            Err(e) => {
                tracing::warn!("Audio disabled: {}", e);
                None
            }
        }
    } else {
        None
    };
    if let Some(engine) = engine.as_mut() {
        client = client.with_audio(engine.take_outbound(), engine.take_playback());
    }

    let mut task = tokio::task::spawn_blocking(move || client.run());
    let result = tokio::select! {
        result = &mut task => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown requested");
            shutdown.trigger();
            task.await
        }
    };

    if let Some(mut engine) = engine {
        engine.shutdown();
    }
    result?.context("client stopped")
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
}
