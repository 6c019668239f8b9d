mod commands;
mod observer;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarmcast_audio::{
    default_input_device_name, list_input_devices, list_output_devices, CpalCapture, CpalPlayback,
};
use swarmcast_core::{StationConfig, TopicKey};
use swarmcast_session::PcmEngine;
use swarmcast_station::{spawn_station, StationController, StationHandle};
use swarmcast_swarm::Swarm;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Input;
use crate::observer::TerminalObserver;

#[derive(Parser)]
#[command(name = "swarmcast", version, about = "Live audio stations on the local network")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a new random station key
    Keygen,
    /// List audio input and output devices
    Devices,
    /// Broadcast the audio input as a station
    Broadcast {
        /// Station key (hex); a new one is generated when omitted
        #[arg(long)]
        key: Option<TopicKey>,
        /// Audio input device name
        #[arg(long)]
        device: Option<String>,
    },
    /// Listen to a station
    Listen {
        /// Station key (hex)
        key: TopicKey,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref())?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = StationConfig::load(&config_path)?;
    tracing::debug!("Config path: {}", config_path.display());

    match cli.command {
        Command::Keygen => {
            println!("{}", TopicKey::random().to_hex());
        }
        Command::Devices => print_devices()?,
        Command::Broadcast { key, device } => {
            if device.is_some() {
                config.audio.input_device = device;
            }
            let key = key.unwrap_or_else(TopicKey::random);
            let station = start_station(&config);
            station.create_station(key).await?;
            interact(&station).await?;
        }
        Command::Listen { key } => {
            let station = start_station(&config);
            station.join_station(key).await?;
            interact(&station).await?;
        }
    }

    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,swarmcast=debug".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .context("--log-file must name a file")?;
            std::fs::create_dir_all(dir)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Platform config location
fn default_config_path() -> Result<PathBuf> {
    let config_dir = if cfg!(target_os = "macos") {
        dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?
            .join("Library")
            .join("Application Support")
            .join("swarmcast")
    } else {
        dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))?
            .join("swarmcast")
    };

    Ok(config_dir.join("config.toml"))
}

fn print_devices() -> Result<()> {
    let default_input = default_input_device_name();
    println!("Input devices:");
    for name in list_input_devices()? {
        let marker = if Some(&name) == default_input.as_ref() { " (default)" } else { "" };
        println!("  {}{}", name, marker);
    }
    println!("Output devices:");
    for name in list_output_devices()? {
        println!("  {}", name);
    }
    Ok(())
}

fn start_station(config: &StationConfig) -> StationHandle {
    let swarm = Swarm::new(config.network.clone());
    let engine = PcmEngine::new(config.audio.format())
        .with_ice_servers(config.network.ice_servers.clone())
        .with_host_addresses(vec![swarm.host_ip()]);

    let controller = StationController::new(
        config,
        Box::new(swarm),
        Arc::new(engine),
        Arc::new(CpalCapture::new()),
        Box::new(CpalPlayback::new(config.audio.output_device.clone())),
        Arc::new(TerminalObserver),
    );
    let (handle, _task) = spawn_station(controller);
    handle
}

async fn interact(station: &StationHandle) -> Result<()> {
    println!("Type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match commands::parse(&line) {
            Input::Source(device) => match station.apply_audio_source(device).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => tracing::warn!("Audio source not changed: {}", e),
                Err(e) => return Err(e.into()),
            },
            Input::Status => {
                let status = station.status().await?;
                println!("State: {}", status.state.as_str());
                let text = status.info_text();
                if !text.is_empty() {
                    println!("{}", text);
                }
            }
            Input::Devices => print_devices()?,
            Input::Help => println!("{}", commands::HELP),
            Input::Leave => break,
            Input::Empty => {}
            Input::Unknown(message) => eprintln!("{} (try 'help')", message),
        }
    }

    station.shutdown().await?;
    Ok(())
}
