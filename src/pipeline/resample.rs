//! Resampling onto the simulation grid (stage two)
//!
//! All indicator signal arrays are aligned to a single simulation
//! resolution. Both upsampling and downsampling use the same rule: the
//! value at each grid timestamp is the last native sample at or before that
//! timestamp. This is a value-at-boundary snapshot, not an OR over the
//! bucket, which keeps edge semantics stable across resolutions.

use std::collections::HashMap;

use crate::pipeline::precalc::PrecalcOutput;
use crate::types::Candle;

/// Finest resolution the engine simulates at, in seconds.
pub const MIN_SIMULATION_RESOLUTION: i64 = 60;

/// Bucket sizes the simulation resolution snaps to.
pub const STANDARD_BUCKETS: &[i64] = &[1, 5, 15, 30, 60, 300, 900, 1800, 3600, 14400, 86400];

/// Snap a stride to the nearest standard bucket (ties toward the smaller).
pub fn standard_bucket(secs: i64) -> i64 {
    let mut best = STANDARD_BUCKETS[0];
    for &bucket in STANDARD_BUCKETS {
        if (bucket - secs).abs() < (best - secs).abs() {
            best = bucket;
        }
    }
    best
}

/// Pick the simulation resolution for a set of pre-calculated indicators:
/// the finest native resolution present, floored at
/// [`MIN_SIMULATION_RESOLUTION`], snapped to a standard bucket.
pub fn simulation_resolution(precalc: &PrecalcOutput) -> i64 {
    let finest = precalc
        .min_native_resolution()
        .unwrap_or(MIN_SIMULATION_RESOLUTION);
    standard_bucket(finest.max(MIN_SIMULATION_RESOLUTION))
}

/// The simulation timeline: strictly ascending timestamps at a uniform
/// stride, plus the number of leading bars reserved for indicator warmup.
#[derive(Debug, Clone)]
pub struct SimulationGrid {
    pub resolution_secs: i64,
    pub timestamps: Vec<i64>,
    pub warmup_bars: usize,
}

impl SimulationGrid {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Build the grid from candles already aggregated to the simulation
/// resolution.
pub fn build_grid(
    sim_candles: &[Candle],
    resolution_secs: i64,
    warmup_candles: usize,
) -> SimulationGrid {
    let warmup_bars = ((warmup_candles as i64 * MIN_SIMULATION_RESOLUTION) as u64)
        .div_ceil(resolution_secs as u64) as usize;
    SimulationGrid {
        resolution_secs,
        timestamps: sim_candles.iter().map(|c| c.bucket).collect(),
        warmup_bars,
    }
}

/// All indicator streams aligned to one grid. Every array has exactly
/// `grid.len()` entries.
#[derive(Debug, Clone)]
pub struct ResampledSignals {
    pub grid: SimulationGrid,
    pub signals: HashMap<String, Vec<bool>>,
    pub values: HashMap<String, Vec<f64>>,
}

/// Align every pre-calculated series to the grid.
pub fn resample(precalc: &PrecalcOutput, grid: SimulationGrid) -> ResampledSignals {
    let mut signals = HashMap::new();
    let mut values = HashMap::new();

    for (key, series) in &precalc.series {
        signals.insert(
            key.clone(),
            sample_at_or_before(&series.timestamps, &series.signals, &grid.timestamps, false),
        );
        values.insert(
            key.clone(),
            sample_at_or_before(
                &series.timestamps,
                &series.values,
                &grid.timestamps,
                f64::NAN,
            ),
        );
    }

    ResampledSignals {
        grid,
        signals,
        values,
    }
}

/// For each grid timestamp, take the last source sample at or before it;
/// `default` before the first source sample.
fn sample_at_or_before<T: Copy>(
    src_ts: &[i64],
    src: &[T],
    grid_ts: &[i64],
    default: T,
) -> Vec<T> {
    let mut out = Vec::with_capacity(grid_ts.len());
    let mut j: usize = 0;
    let mut current: Option<T> = None;

    for &t in grid_ts {
        while j < src_ts.len() && src_ts[j] <= t {
            current = Some(src[j]);
            j += 1;
        }
        out.push(current.unwrap_or(default));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_bucket_snapping() {
        assert_eq!(standard_bucket(60), 60);
        assert_eq!(standard_bucket(299), 300);
        assert_eq!(standard_bucket(100), 60);
        assert_eq!(standard_bucket(1000), 900);
        assert_eq!(standard_bucket(100_000), 86400);
    }

    #[test]
    fn test_downsample_is_snapshot_not_or() {
        // native 1m samples: a true blip inside the 5m bucket that is false
        // again at the boundary must not leak through
        let src_ts: Vec<i64> = (0..10).map(|i| i * 60).collect();
        let src = vec![
            false, true, false, false, false, // bucket 0
            false, false, false, false, false, // bucket 300
        ];
        let grid_ts = vec![240, 540];
        let out = sample_at_or_before(&src_ts, &src, &grid_ts, false);
        assert_eq!(out, vec![false, false]);
    }

    #[test]
    fn test_upsample_forward_fills() {
        let src_ts = vec![0, 300];
        let src = vec![true, false];
        let grid_ts: Vec<i64> = (0..10).map(|i| i * 60).collect();
        let out = sample_at_or_before(&src_ts, &src, &grid_ts, false);
        assert_eq!(
            out,
            vec![true, true, true, true, true, false, false, false, false, false]
        );
    }

    #[test]
    fn test_before_first_sample_is_default() {
        let src_ts = vec![300];
        let src = vec![true];
        let grid_ts = vec![0, 60, 300, 360];
        let out = sample_at_or_before(&src_ts, &src, &grid_ts, false);
        assert_eq!(out, vec![false, false, true, true]);
    }

    #[test]
    fn test_resample_is_idempotent_on_matching_grid() {
        let src_ts: Vec<i64> = (0..6).map(|i| i * 60).collect();
        let src = vec![false, true, true, false, true, false];
        let once = sample_at_or_before(&src_ts, &src, &src_ts, false);
        assert_eq!(once, src);
        let twice = sample_at_or_before(&src_ts, &once, &src_ts, false);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_warmup_bar_conversion() {
        let sim_candles: Vec<Candle> = (0..10)
            .map(|i| Candle::new_unchecked(i * 300, 1.0, 1.0, 1.0, 1.0, 0.0))
            .collect();
        // 70 one-minute units at a 5m simulation resolution -> 14 bars
        let grid = build_grid(&sim_candles, 300, 70);
        assert_eq!(grid.warmup_bars, 14);
        // rounding up: 71 units -> 15 bars
        let grid = build_grid(&sim_candles, 300, 71);
        assert_eq!(grid.warmup_bars, 15);
    }
}
