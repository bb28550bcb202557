//! `pvcam-stream`: stream frames from a camera to PRD or TIFF files.
//!
//! ```bash
//! pvcam-stream list
//! pvcam-stream run --mode snap-circ-buffer -n 500 --storage prd --save-dir /data/run1
//! pvcam-stream run --config stream.toml --mode live-circ-buffer
//! pvcam-stream inspect /data/run1/000.prd --records 20
//! pvcam-stream config --config stream.toml
//! ```

mod commands;
mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::RunOverrides;
use config::AppConfig;
use logging::OutputFormat;
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "pvcam-stream", version)]
#[command(about = "Stream camera frames to disk with loss accounting", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras.
    List,

    /// Run one acquisition.
    Run(RunOverrides),

    /// Print the header and frame records of a PRD file.
    Inspect {
        path: PathBuf,

        /// Print at most this many records.
        #[arg(long)]
        records: Option<usize>,
    },

    /// Print the effective configuration as TOML.
    Config(RunOverrides),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.log_json {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    logging::init(&cli.log_level, format)?;

    let load = || {
        AppConfig::load(cli.config.as_deref()).context("failed to load configuration")
    };

    match &cli.command {
        Commands::List => commands::list(&load()?),
        Commands::Run(overrides) => {
            let mut cfg = load()?;
            overrides.apply(&mut cfg);
            commands::run(cfg).await
        }
        Commands::Inspect { path, records } => commands::inspect(path, *records),
        Commands::Config(overrides) => {
            let mut cfg = load()?;
            overrides.apply(&mut cfg);
            print!("{}", cfg.to_toml().context("failed to serialize configuration")?);
            Ok(())
        }
    }
}
