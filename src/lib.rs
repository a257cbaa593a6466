pub mod bootloader;
pub mod config;
pub mod connection;
pub mod emulator;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod sink;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoaderConfig;
use crate::emulator::{EmulatorConfig, EmulatorTransport};
use crate::error::{classify, FlashError};
use crate::loader::BinarySegmentLoader;
use crate::manifest::ManifestCatalog;
use crate::orchestrator::FlashOrchestrator;
use crate::sink::TracingSink;

/// Baud rates the serial bootloader accepts.
pub const BAUD_RATES: [u32; 6] = [9600, 57600, 115_200, 230_400, 460_800, 921_600];
const DEFAULT_BAUD_RATE: u32 = 115_200;
const CLI_PROGRESS_STEP: u8 = 10;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EMULATED_FLASH_SIZE: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON firmware manifest mapping selection names to firmware builds
    #[clap(long, env)]
    pub manifest: Option<PathBuf>,
    /// Base URL relative segment paths are fetched from
    #[clap(long, env)]
    pub firmware_base_url: Option<String>,
    /// Directory relative segment paths are read from when no base URL is set
    #[clap(long, env, default_value = ".")]
    pub firmware_dir: PathBuf,
    #[clap(long, env, default_value_t = DEFAULT_BAUD_RATE, value_parser = parse_baud_rate)]
    pub baud_rate: u32,
    /// Minimum percent increment between two progress lines
    #[clap(long, env, default_value_t = CLI_PROGRESS_STEP, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub progress_step: u8,
    #[clap(long, env, default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    pub http_timeout_secs: u64,
    /// Flash size of the emulated device, in bytes
    #[clap(long, env, default_value_t = DEFAULT_EMULATED_FLASH_SIZE)]
    pub emulated_flash_size: usize,
    #[clap(long, env, default_value = "info")]
    log_level: LevelFilter,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the firmware available in the manifest
    List,
    /// Connect, print the chip identity and disconnect
    Info,
    /// Flash a firmware from the manifest and reset the device into it
    Program {
        /// Selection name of the firmware in the manifest
        name: String,
    },
    /// Erase the entire flash
    Erase {
        /// Confirm that the whole flash, including any stored data, is wiped
        #[clap(long)]
        yes: bool,
    },
}

fn parse_baud_rate(val: &str) -> Result<u32, String> {
    let rate: u32 = val
        .parse()
        .map_err(|e| format!("invalid baud rate '{val}': {e}"))?;
    if BAUD_RATES.contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("unsupported baud rate {rate}, expected one of {BAUD_RATES:?}"))
    }
}

/// Runs one `flashflux` command.
///
/// Programming and erasing always end with a disconnect, which resets the
/// device and releases the link even when the operation failed.
///
/// # Errors
///
/// Returns an error if:
/// - The manifest cannot be read or parsed.
/// - The loader configuration is invalid.
/// - The device operation fails; the error then carries the classified
///   diagnosis with its remediation hint.
pub async fn run(cli: Cli) -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(cli.log_level)
        .with(fmt::layer())
        .init();

    match &cli.command {
        Command::List => {
            let catalog = load_catalog(&cli).await?;
            for (key, entry) in catalog.iter() {
                println!(
                    "{key}\t{} v{}\t{} segment(s)",
                    entry.name,
                    entry.version,
                    entry.segments.len()
                );
            }
            Ok(())
        }
        Command::Info => {
            let orchestrator = build_orchestrator(&cli)?;
            let identity = orchestrator
                .connect(cli.baud_rate)
                .await
                .map_err(diagnose)?;
            println!("Chip: {}", identity.chip);
            println!("MAC:  {}", identity.mac.as_deref().unwrap_or("unknown"));
            orchestrator.disconnect().await;
            Ok(())
        }
        Command::Program { name } => {
            let catalog = load_catalog(&cli).await?;
            let orchestrator = build_orchestrator(&cli)?;
            orchestrator
                .connect(cli.baud_rate)
                .await
                .map_err(diagnose)?;

            let result = orchestrator.program_named(&catalog, name).await;
            orchestrator.disconnect().await;
            result.map_err(diagnose)
        }
        Command::Erase { yes } => {
            let orchestrator = build_orchestrator(&cli)?;
            if !yes {
                if let Err(FlashError::Cancelled) = orchestrator.erase(false).await {
                    info!("Nothing erased, pass --yes to confirm");
                }
                return Ok(());
            }

            orchestrator
                .connect(cli.baud_rate)
                .await
                .map_err(diagnose)?;
            let result = orchestrator.erase(true).await;
            orchestrator.disconnect().await;
            result.map_err(diagnose)
        }
    }
}

async fn load_catalog(cli: &Cli) -> Result<ManifestCatalog> {
    let path = cli
        .manifest
        .as_ref()
        .ok_or_else(|| anyhow!("--manifest is required for this command"))?;
    let catalog = ManifestCatalog::from_path(path).await?;
    info!(entries = catalog.len(), path = %path.display(), "Firmware manifest loaded");
    Ok(catalog)
}

fn build_orchestrator(cli: &Cli) -> Result<FlashOrchestrator> {
    let loader_config = LoaderConfig::new(
        cli.firmware_base_url.as_deref(),
        cli.firmware_dir.clone(),
        Duration::from_secs(cli.http_timeout_secs),
    )
    .context("configure segment loader")?;

    let transport = EmulatorTransport::new(EmulatorConfig {
        flash_size: cli.emulated_flash_size,
        ..EmulatorConfig::default()
    });

    Ok(FlashOrchestrator::new(
        Arc::new(transport),
        BinarySegmentLoader::new(&loader_config),
        Arc::new(TracingSink),
    )
    .with_progress_step(cli.progress_step))
}

fn diagnose(error: FlashError) -> anyhow::Error {
    let diagnosis = classify(&error);
    anyhow::Error::new(error).context(diagnosis.to_string())
}
