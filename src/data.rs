//! Candle loading and preparation
//!
//! Handles loading OHLCV data from CSV files, strict validation of the
//! candle stream, and aggregation to coarser timeframes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

use crate::error::BacktestError;
use crate::types::Candle;

/// Load OHLCV data from a CSV file with columns
/// `datetime,open,high,low,close,volume`.
///
/// The datetime column accepts RFC 3339, `%Y-%m-%d %H:%M:%S` (assumed UTC),
/// or raw epoch seconds.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let bucket = parse_bucket(dt_str)
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let open: f64 = record
            .get(1)
            .context("Missing open column")?
            .parse()
            .context("Failed to parse open")?;
        let high: f64 = record
            .get(2)
            .context("Missing high column")?
            .parse()
            .context("Failed to parse high")?;
        let low: f64 = record
            .get(3)
            .context("Missing low column")?
            .parse()
            .context("Failed to parse low")?;
        let close: f64 = record
            .get(4)
            .context("Missing close column")?
            .parse()
            .context("Failed to parse close")?;
        let volume: f64 = record
            .get(5)
            .context("Missing volume column")?
            .parse()
            .context("Failed to parse volume")?;

        candles.push(Candle {
            bucket,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    info!(
        "Loaded {} candles from {}",
        candles.len(),
        path.as_ref().display()
    );
    Ok(candles)
}

/// Parse a datetime cell into epoch seconds.
fn parse_bucket(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt.timestamp());
    }
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .context("Unrecognized datetime format")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).timestamp())
}

/// Validate a candle stream: finite fields, OHLC relation, strictly
/// ascending buckets. The first violation aborts the run.
pub fn validate_candles(candles: &[Candle]) -> Result<(), BacktestError> {
    if candles.is_empty() {
        return Err(BacktestError::InvalidCandleData {
            index: 0,
            reason: "empty candle stream".to_string(),
        });
    }

    for (i, candle) in candles.iter().enumerate() {
        candle
            .check()
            .map_err(|reason| BacktestError::InvalidCandleData { index: i, reason })?;

        if i > 0 && candle.bucket <= candles[i - 1].bucket {
            return Err(BacktestError::InvalidCandleData {
                index: i,
                reason: format!(
                    "buckets not strictly ascending: {} after {}",
                    candle.bucket,
                    candles[i - 1].bucket
                ),
            });
        }
    }

    Ok(())
}

/// Aggregate candles into coarser buckets of `target_secs`.
///
/// Each output bucket opens with the first candle's open, closes with the
/// last candle's close, spans the min/max of its members, and sums volume.
/// Returns the input unchanged when it is already at the target stride.
pub fn aggregate_candles(candles: &[Candle], target_secs: i64) -> Vec<Candle> {
    if candles.is_empty() || target_secs <= 0 {
        return Vec::new();
    }
    if candles
        .windows(2)
        .all(|w| w[1].bucket - w[0].bucket == target_secs)
        && candles[0].bucket % target_secs == 0
    {
        return candles.to_vec();
    }

    let mut out: Vec<Candle> = Vec::new();
    for candle in candles {
        let bucket = candle.bucket - candle.bucket.rem_euclid(target_secs);
        match out.last_mut() {
            Some(last) if last.bucket == bucket => {
                last.high = last.high.max(candle.high);
                last.low = last.low.min(candle.low);
                last.close = candle.close;
                last.volume += candle.volume;
            }
            _ => {
                out.push(Candle {
                    bucket,
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                });
            }
        }
    }
    out
}

/// Restrict a candle stream to `[start, end]` (inclusive, epoch seconds).
pub fn slice_by_time(candles: &[Candle], start: Option<i64>, end: Option<i64>) -> Vec<Candle> {
    candles
        .iter()
        .filter(|c| {
            start.map_or(true, |s| c.bucket >= s) && end.map_or(true, |e| c.bucket <= e)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(bucket: i64, close: f64) -> Candle {
        Candle::new_unchecked(bucket, close, close + 1.0, close - 1.0, close, 100.0)
    }

    #[test]
    fn test_validate_accepts_well_formed_stream() {
        let candles = vec![candle(0, 100.0), candle(60, 101.0), candle(120, 99.0)];
        assert!(validate_candles(&candles).is_ok());
    }

    #[test]
    fn test_validate_rejects_unsorted_buckets() {
        let candles = vec![candle(60, 100.0), candle(0, 101.0)];
        let err = validate_candles(&candles).unwrap_err();
        assert!(matches!(
            err,
            BacktestError::InvalidCandleData { index: 1, .. }
        ));
    }

    #[test]
    fn test_validate_rejects_ohlc_violation() {
        let mut bad = candle(0, 100.0);
        bad.high = 99.0;
        assert!(validate_candles(&[bad]).is_err());
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(validate_candles(&[]).is_err());
    }

    #[test]
    fn test_aggregate_folds_buckets() {
        // four 1m candles -> one 5m candle (partial bucket)
        let candles = vec![
            Candle::new_unchecked(0, 100.0, 102.0, 99.0, 101.0, 10.0),
            Candle::new_unchecked(60, 101.0, 105.0, 100.0, 104.0, 20.0),
            Candle::new_unchecked(120, 104.0, 104.5, 95.0, 96.0, 30.0),
            Candle::new_unchecked(180, 96.0, 98.0, 96.0, 97.0, 40.0),
        ];
        let out = aggregate_candles(&candles, 300);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bucket, 0);
        assert_eq!(out[0].open, 100.0);
        assert_eq!(out[0].high, 105.0);
        assert_eq!(out[0].low, 95.0);
        assert_eq!(out[0].close, 97.0);
        assert_eq!(out[0].volume, 100.0);
    }

    #[test]
    fn test_aggregate_is_identity_at_target_stride() {
        let candles = vec![candle(0, 100.0), candle(300, 101.0), candle(600, 102.0)];
        let out = aggregate_candles(&candles, 300);
        assert_eq!(out, candles);
    }

    #[test]
    fn test_slice_by_time() {
        let candles = vec![candle(0, 100.0), candle(60, 101.0), candle(120, 102.0)];
        let out = slice_by_time(&candles, Some(60), Some(60));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bucket, 60);
        assert_eq!(slice_by_time(&candles, None, None).len(), 3);
    }
}
