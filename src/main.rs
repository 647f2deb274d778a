//! powervol CLI
//!
//! # Usage
//!
//! ```bash
//! # Generate a synthetic two-market panel
//! powervol synth --days 1000 --markets DE,FR --seed 42 --output data/synth
//!
//! # Run the walk-forward pipeline
//! powervol run --config config/default.toml \
//!     --returns data/synth/returns.csv --regimes data/synth/regimes.csv \
//!     --output results
//!
//! # Validate a configuration and print the effective values
//! powervol check-config --config config/default.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use powervol_backtest::{
    DataLoader, EngineConfig, Pipeline, ReportWriter, SyntheticConfig, SyntheticGenerator,
};

const SEPARATOR: &str = "============================================================";

#[derive(Parser)]
#[command(name = "powervol")]
#[command(about = "Walk-forward residual volatility forecasting for coupled power markets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full walk-forward pipeline
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Returns table (CSV or Parquet)
        #[arg(long)]
        returns: PathBuf,

        /// Regime table (CSV or Parquet)
        #[arg(long)]
        regimes: Option<PathBuf>,

        /// Output directory for results
        #[arg(short, long, default_value = "results")]
        output: PathBuf,
    },

    /// Write a synthetic returns and regimes panel
    Synth {
        /// Trading days to generate
        #[arg(long, default_value_t = 1000)]
        days: usize,

        /// Comma-separated list of markets
        #[arg(long, default_value = "DE,FR")]
        markets: String,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Replace the leading regime variable with noise
        #[arg(long)]
        noise: bool,

        /// Output directory
        #[arg(short, long, default_value = "data/synth")]
        output: PathBuf,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("powervol_backtest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            returns,
            regimes,
            output,
        } => cmd_run(config, returns, regimes, output),
        Commands::Synth {
            days,
            markets,
            seed,
            noise,
            output,
        } => {
            let market_list: Vec<String> = markets
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            cmd_synth(days, market_list, seed, noise, output)
        }
        Commands::CheckConfig { config } => cmd_check_config(config),
    }
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = EngineConfig::from_toml_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn cmd_run(
    config_path: PathBuf,
    returns: PathBuf,
    regimes: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let started = Instant::now();
    let config = load_config(&config_path)?;

    let dataset = DataLoader::new(config.data.clone())
        .load_dataset(&returns, regimes.as_deref())
        .context("Failed to load input data")?;

    let report = Pipeline::new(&config)?
        .run(&dataset)
        .context("Walk-forward run failed")?;

    let paths = ReportWriter::new(&output)
        .write_run(&report)
        .context("Failed to write report")?;

    println!("{}", SEPARATOR);
    println!("{}", report.summary());
    println!("{}", SEPARATOR);
    for path in paths {
        println!("  wrote {}", path.display());
    }
    println!("Completed in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

fn cmd_synth(
    days: usize,
    markets: Vec<String>,
    seed: u64,
    noise: bool,
    output: PathBuf,
) -> Result<()> {
    anyhow::ensure!(!markets.is_empty(), "At least one market is required");
    let dataset = SyntheticGenerator::new(SyntheticConfig {
        days,
        markets,
        seed,
        noise,
        ..Default::default()
    })
    .generate()
    .context("Failed to generate synthetic panel")?;

    let paths = ReportWriter::new(&output)
        .write_dataset(&dataset)
        .context("Failed to write synthetic panel")?;
    for path in paths {
        println!("  wrote {}", path.display());
    }
    Ok(())
}

fn cmd_check_config(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    println!("{}", SEPARATOR);
    println!("Configuration OK: {}", config_path.display());
    println!("{}", SEPARATOR);
    println!("{}", config.to_toml_string()?);
    Ok(())
}
