//! Algo backtester - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Run a strategy definition over historical candle data
//! - validate: Check a candle CSV for data integrity

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "algo-backtest")]
#[command(about = "Deterministic backtesting engine for indicator-based trading algorithms", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a strategy backtest
    Backtest {
        /// Path to the strategy definition (JSON)
        #[arg(short, long)]
        config: String,

        /// Path to the candle CSV (datetime,open,high,low,close,volume)
        #[arg(short, long)]
        data: String,

        /// Write the full JSON report to this path
        #[arg(short, long)]
        output: Option<String>,

        /// Persist events to a sqlite database at this path
        #[arg(long)]
        event_db: Option<String>,

        /// Starting capital override (USD)
        #[arg(long)]
        capital: Option<f64>,

        /// Stop after this many closed trades
        #[arg(long)]
        trades_limit: Option<u32>,
    },

    /// Validate a candle CSV
    Validate {
        /// Path to the candle CSV
        #[arg(short, long)]
        data: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Validate { .. } => "validate",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            data,
            output,
            event_db,
            capital,
            trades_limit,
        } => commands::backtest::run(config, data, output, event_db, capital, trades_limit),

        Commands::Validate { data } => commands::validate::run(data),
    }
}
