//! Candle data validation command

use anyhow::{Context, Result};
use tracing::info;

use algo_backtest::data;

pub fn run(data_path: String) -> Result<()> {
    let candles = data::load_csv(&data_path)
        .context(format!("Failed to load candle data from {}", data_path))?;

    match data::validate_candles(&candles) {
        Ok(()) => {
            let first = candles.first().expect("validated stream is non-empty");
            let last = candles.last().expect("validated stream is non-empty");
            info!(
                "OK: {} candles, {} to {}",
                candles.len(),
                first.datetime().format("%Y-%m-%d %H:%M:%S"),
                last.datetime().format("%Y-%m-%d %H:%M:%S")
            );
            println!("OK: {} candles pass validation", candles.len());
            Ok(())
        }
        Err(err) => {
            println!("INVALID: {}", err);
            anyhow::bail!("candle data failed validation: {}", err)
        }
    }
}
