//! CLI entry point for burst-daq
//!
//! Provides command-line interface for:
//! - Running one acquisition against the simulated digitizer
//! - Checking a configuration file and printing the effective settings
//!
//! # Usage
//!
//! Run 50 bursts in post-trigger mode:
//! ```bash
//! burst-daq --config burst_daq.toml run --bursts 50
//! ```
//!
//! Print the configuration after file and environment overrides:
//! ```bash
//! BURST_DAQ_DIGITIZER__NUM_CHANNELS=4 burst-daq check-config
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use burst_daq::config::AppConfig;
use burst_daq::{logging, runner};
use clap::{Parser, Subcommand, ValueEnum};
use daq_core::ArmMode;

#[derive(Parser)]
#[command(name = "burst-daq")]
#[command(about = "Burst-mode digitizer acquisition with a simulated device", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Arm the simulated digitizer and report what was acquired
    Run {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Bursts per arm cycle, 0 for unlimited
        #[arg(long)]
        bursts: Option<i32>,

        /// Run timeout, e.g. "5s" or "500ms"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Load and validate the configuration, then print it as JSON
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Post,
    PrePost,
}

impl From<ModeArg> for ArmMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Post => ArmMode::PostTrigger,
            ModeArg::PrePost => ArmMode::PrePostTrigger,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::load_env().context("failed to load configuration")?,
    };

    match cli.command {
        Commands::Run {
            mode,
            bursts,
            timeout,
        } => {
            if let Some(mode) = mode {
                config.acquisition.mode = mode.into();
            }
            if let Some(bursts) = bursts {
                config.acquisition.num_bursts = bursts;
            }
            if let Some(timeout) = timeout {
                config.acquisition.timeout = timeout;
            }
            config.validate()?;
            logging::init_from_config(&config)?;

            let report = runner::run(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(error) = &report.last_error {
                anyhow::bail!("acquisition failed: {}", error);
            }
            Ok(())
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
