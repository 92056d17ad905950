//! CLI Entry Point for daq-sequencer
//!
//! Provides command-line access to:
//! - Sending raw commands to a serial instrument and printing its replies
//! - Checking the resolved configuration
//!
//! # Usage
//!
//! Query an instrument:
//! ```bash
//! daq-sequencer send --port /dev/ttyUSB0 "*IDN?"
//! ```
//!
//! Show what would be sent, without opening a port:
//! ```bash
//! daq-sequencer send --dry-run ":RF:LEVEL -10 dBm" ":RF:LEVEL?"
//! ```
//!
//! Validate configuration:
//! ```bash
//! DAQ_SEQ_SERIAL__BAUD_RATE=19200 daq-sequencer check-config
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_sequencer::blocks::CommandResponse;
use daq_sequencer::config::{SequencerConfig, SerialSettings, DEFAULT_CONFIG_PATH};
use daq_sequencer::sequencer::Scheduler;
use daq_sequencer::serial::{ScriptedTransport, SerialLineTransport, Transcript};
use daq_sequencer::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Bytes left over from a previous session are discarded for this long after opening.
#[cfg(feature = "tokio_serial")]
const DRAIN_MS: u64 = 50;

#[derive(Parser)]
#[command(name = "daq-sequencer")]
#[command(about = "Hierarchical serial command sequencer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send up to three command lines and print the replies
    Send {
        /// Serial port (overrides configuration)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate (overrides configuration)
        #[arg(long)]
        baud: Option<u32>,

        /// Total reply lines to collect beyond the `?` count
        #[arg(long)]
        lines: Option<usize>,

        /// Record the exchange against an in-memory device instead of a port
        #[arg(long)]
        dry_run: bool,

        /// Command lines
        #[arg(required = true, num_args = 1..=3)]
        commands: Vec<String>,
    },

    /// Load, validate and print the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let mut tracing_config = TracingConfig::from_config(&config).map_err(|e| anyhow!(e))?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    tracing_setup::init(tracing_config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Send {
            port,
            baud,
            lines,
            dry_run,
            commands,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.serial.port = port;
            }
            if let Some(baud) = baud {
                config.serial.baud_rate = baud;
            }
            send(config, commands, lines, dry_run).await
        }
        Commands::CheckConfig => check_config(&cli.config, &config),
    }
}

fn load_config(path: &Path) -> Result<SequencerConfig> {
    let config = SequencerConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn check_config(path: &Path, config: &SequencerConfig) -> Result<()> {
    println!("✅ Configuration OK ({})", path.display());
    println!("{:#?}", config);
    Ok(())
}

async fn send(
    config: SequencerConfig,
    commands: Vec<String>,
    lines: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let scheduler = Arc::new(Scheduler::with_settings(config.scheduling));

    let transcript: Option<Transcript> = if dry_run {
        let transport = ScriptedTransport::new().with_timeout(config.serial.read_timeout());
        let transcript = transport.transcript();
        scheduler.attach(transport).await;
        Some(transcript)
    } else {
        let transport = open_serial(&config.serial).await?;
        scheduler.attach(transport).await;
        None
    };

    let raw = Arc::new(CommandResponse::new());
    raw.set_commands(commands);
    raw.set_response_lines(lines);
    raw.register(&*scheduler, [config.application.name.as_str()])?;

    let summary = raw.send(&*scheduler).await?;
    info!(
        blocks = summary.executed.len(),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Exchange complete"
    );

    if let Some(transcript) = transcript {
        for line in transcript.sent() {
            println!("SENT:  {}", line);
        }
    }
    for (index, slot) in raw.response_slots().iter().enumerate() {
        println!("RESP{}: {}", index + 1, slot);
    }

    scheduler.detach().await;

    if let Some(report) = scheduler.errors().current() {
        bail!("Device error {}", report);
    }
    Ok(())
}

#[cfg(feature = "tokio_serial")]
async fn open_serial(settings: &SerialSettings) -> Result<SerialLineTransport> {
    let transport = SerialLineTransport::open(settings).await?;
    let drained = transport.drain_input(DRAIN_MS).await;
    if drained > 0 {
        tracing::warn!(bytes = drained, port = %settings.port, "Discarded stale input");
    }
    Ok(transport)
}

#[cfg(not(feature = "tokio_serial"))]
async fn open_serial(settings: &SerialSettings) -> Result<SerialLineTransport> {
    bail!(
        "Cannot open {}: serial support not enabled. Rebuild with --features tokio_serial or use --dry-run",
        settings.port
    )
}
