use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use captioncast::audio_toolkit::list_input_devices;
use captioncast::logging;
use captioncast::settings::load_or_create_settings;
use captioncast::TranscribeEngine;

#[derive(Parser)]
#[command(name = "captioncast", version, about = "Live microphone transcription with multi-listener broadcast")]
struct Cli {
    /// Settings file; created with defaults if missing.
    #[arg(long, value_name = "FILE", default_value = "settings.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Capture and transcribe until interrupted (the default).
    Run,
    /// Print the available input devices and exit.
    ListDevices,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config),
        Command::ListDevices => list_devices(),
    }
}

fn list_devices() -> anyhow::Result<()> {
    let devices = list_input_devices().context("could not enumerate input devices")?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }
    for device in devices {
        if device.is_default {
            println!("{} (default)", device.name);
        } else {
            println!("{}", device.name);
        }
    }
    Ok(())
}

fn run(config: PathBuf) -> anyhow::Result<()> {
    let settings = load_or_create_settings(&config)?;
    let tap = logging::init(&settings.logs_folder)?;
    std::fs::create_dir_all(&settings.transcripts_folder)?;

    let engine = TranscribeEngine::new(config, settings, tap);
    engine.start();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    info!("Interrupt received, shutting down");
    engine.shutdown();
    Ok(())
}
