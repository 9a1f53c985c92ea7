//! # Harmony
//!
//! Command-line player for the Harmony playback engine.

mod args;
mod player;

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use harmony_audio::{list_output_devices, AudioEngine};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harmony=info,harmony_app=info,harmony_audio=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in list_output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let settings = args.settings()?;
    if args.print_settings {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    let sources = args.track_sources()?;

    info!("Starting Harmony v{}", env!("CARGO_PKG_VERSION"));

    let engine = AudioEngine::with_device(settings, args.device.clone())
        .context("Failed to start audio engine")?;
    let format = engine.format();
    info!(
        "Output: {} Hz, {} channels, {} samples per frame",
        format.sample_rate, format.channels, format.frame_len
    );

    let result = player::play_queue(&engine, sources);
    engine.shutdown()?;
    result
}
