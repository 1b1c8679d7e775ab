//! Backtest command implementation

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use algo_backtest::backtest::Backtester;
use algo_backtest::config::BacktestInput;
use algo_backtest::data;
use algo_backtest::eventlog::SqliteEventLog;

pub fn run(
    config_path: String,
    data_path: String,
    output_path: Option<String>,
    event_db: Option<String>,
    capital_override: Option<f64>,
    trades_limit_override: Option<u32>,
) -> Result<()> {
    info!("Starting backtest");

    let mut input = BacktestInput::from_file(&config_path)?;
    info!("Loaded strategy definition from: {}", config_path);

    if let Some(capital) = capital_override {
        info!("Overriding starting capital to: ${:.2}", capital);
        input.algo.starting_capital_usd = capital;
    }
    if let Some(limit) = trades_limit_override {
        info!("Overriding trades limit to: {}", limit);
        input.run.trades_limit = Some(limit);
    }

    let candles = data::load_csv(&data_path)
        .context(format!("Failed to load candle data from {}", data_path))?;

    let mut backtester = Backtester::new(input);
    if let Some(db_path) = event_db {
        info!("Persisting events to sqlite: {}", db_path);
        let log = SqliteEventLog::open(&db_path).context("Failed to open event database")?;
        backtester = backtester.with_event_log(Box::new(log));
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Simulating {} candles...", candles.len()));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let output = runtime.block_on(backtester.run(&candles))?;

    spinner.finish_and_clear();

    // Print results
    let m = &output.swap_metrics;
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS: {}", output.symbol);
    println!("{}", "=".repeat(60));
    println!("Simulation Res:     {}s", output.simulation_resolution_secs);
    println!("Bars Processed:     {} ({} warmup)", output.bars_processed, output.warmup_bars);
    println!("Starting Equity:    ${:.2}", output.starting_equity);
    println!("Final Equity:       ${:.2}", output.final_equity);
    println!("Total Return:       {:.2}%", m.total_return_pct);
    println!("Sharpe Ratio:       {:.2}", m.sharpe_ratio);
    println!("Sortino Ratio:      {:.2}", m.sortino_ratio);
    println!("Calmar Ratio:       {:.2}", m.calmar_ratio);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown_pct * 100.0);
    println!("Win Rate:           {:.2}%", m.win_rate * 100.0);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Total Trades:       {}", m.total_trades);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Average Win:        ${:.2}", m.avg_win);
    println!("Average Loss:       ${:.2}", m.avg_loss);
    println!("Largest Win:        ${:.2}", m.largest_win);
    println!("Largest Loss:       ${:.2}", m.largest_loss);
    println!("{}", "-".repeat(60));
    println!("Total Fees:         ${:.2}", m.total_fees_usd);
    println!("Total Slippage:     ${:.2}", m.total_slippage_usd);
    println!("Events Logged:      {}", output.events.len());
    println!("{}", "=".repeat(60));

    if !output.algo_metrics.indicators.is_empty() {
        println!("\nINDICATOR DIAGNOSTICS");
        println!("{}", "-".repeat(60));
        for stats in &output.algo_metrics.indicators {
            println!(
                "{:<40} flips={:<4} true={:>5.1}% useful={:>5.1}",
                stats.cache_key,
                stats.flip_count,
                stats.pct_time_true * 100.0,
                stats.usefulness
            );
        }
    }

    if let Some(path) = output_path {
        let path = PathBuf::from(path);
        let json = serde_json::to_string_pretty(&output)?;
        std::fs::write(&path, json)
            .context(format!("Failed to write report to {}", path.display()))?;
        info!("Full report written to {}", path.display());
    }

    info!("Backtest completed");
    Ok(())
}
