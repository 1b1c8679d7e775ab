//! Sub-bar expansion and value-factor pre-calculation (stage three)
//!
//! Each parent bar of the simulation timeframe expands into an ordered
//! sequence of sub-bars at the next-lower timeframe. Real sub-bar data can
//! come from any [`SubBarProvider`]; the synthetic provider reconstructs a
//! plausible intrabar path from the parent OHLC alone. The flattened sub-bar
//! stream also feeds the normalized value-factor lookup used by DYN stops.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::config::IndicatorSpec;
use crate::error::BacktestError;
use crate::pipeline::precalc::IndicatorFactory;
use crate::ports::SubBarProvider;
use crate::types::{Candle, Timeframe};

/// Fraction of the parent range used as jitter bound on interior path
/// points.
const JITTER_FRACTION: f64 = 0.05;

/// Synthesize sub-bars for one parent candle.
///
/// The price path runs from `open` to the favored extreme (high when
/// bullish, low otherwise) over the first half of the sub-bars, then to
/// `close`, with bounded jitter on interior points. All prices stay within
/// `[low, high]`, buckets ascend strictly inside the parent window, and the
/// final sub-bar closes exactly at the parent close. Jitter is seeded from
/// the parent bucket, so expansion is deterministic across runs.
pub fn synthesize_sub_bars(parent: &Candle, parent_tf: Timeframe) -> Vec<Candle> {
    let k = parent_tf.sub_bar_count();
    let sub_tf = match parent_tf.sub_timeframe() {
        Some(tf) => tf,
        None => return Vec::new(),
    };
    let sub_secs = sub_tf.secs();

    let extreme = if parent.is_bullish() {
        parent.high
    } else {
        parent.low
    };
    let pivot = (k / 2).max(1);

    // K+1 anchor points; sub-bar i spans points[i] -> points[i+1]
    let mut points = vec![0.0; k + 1];
    for (i, point) in points.iter_mut().enumerate().take(pivot + 1) {
        let frac = i as f64 / pivot as f64;
        *point = parent.open + (extreme - parent.open) * frac;
    }
    for (i, point) in points.iter_mut().enumerate().skip(pivot) {
        let frac = (i - pivot) as f64 / (k - pivot).max(1) as f64;
        *point = extreme + (parent.close - extreme) * frac;
    }
    points[k] = parent.close;

    let range = parent.high - parent.low;
    let mut rng = StdRng::seed_from_u64(parent.bucket as u64);
    for (i, point) in points.iter_mut().enumerate().take(k).skip(1) {
        if i != pivot {
            *point += rng.gen_range(-1.0..1.0) * range * JITTER_FRACTION;
        }
        *point = point.clamp(parent.low, parent.high);
    }

    (0..k)
        .map(|i| {
            let open = points[i];
            let close = points[i + 1];
            Candle {
                bucket: parent.bucket + i as i64 * sub_secs,
                open,
                high: open.max(close),
                low: open.min(close),
                close,
                volume: parent.volume / k as f64,
            }
        })
        .collect()
}

/// Default sub-bar provider: synthesizes paths from the parent bars handed
/// to it at construction.
pub struct SyntheticSubBarProvider {
    parents: HashMap<i64, Candle>,
}

impl SyntheticSubBarProvider {
    pub fn new(parent_candles: &[Candle]) -> Self {
        SyntheticSubBarProvider {
            parents: parent_candles
                .iter()
                .map(|c| (c.bucket, c.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl SubBarProvider for SyntheticSubBarProvider {
    async fn get_sub_bar_candles(
        &self,
        _symbol: &str,
        parent_ts: i64,
        parent_tf: Timeframe,
    ) -> Vec<Candle> {
        match self.parents.get(&parent_ts) {
            Some(parent) => synthesize_sub_bars(parent, parent_tf),
            None => Vec::new(),
        }
    }
}

/// Timestamped lookup of a normalized (0-100) indicator over the flattened
/// sub-bar stream. Lookups resolve to the value at the greatest stored
/// timestamp at or before the query.
#[derive(Debug, Clone, Default)]
pub struct ValueFactorSeries {
    points: BTreeMap<i64, f64>,
}

impl ValueFactorSeries {
    pub fn from_points(points: BTreeMap<i64, f64>) -> Self {
        ValueFactorSeries { points }
    }

    pub fn lookup(&self, timestamp: i64) -> Option<f64> {
        self.points
            .range(..=timestamp)
            .next_back()
            .map(|(_, &v)| v)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Evaluate a value-factor indicator over the flattened sub-bar stream.
///
/// The indicator must be normalized; a non-normalized factor either fails
/// the run or, when `degrade_to_rel` is set, returns `None` so the caller
/// falls back to plain REL semantics.
pub fn precalc_value_factor(
    spec: &IndicatorSpec,
    factory: &dyn IndicatorFactory,
    sub_bars: &[Candle],
    degrade_to_rel: bool,
) -> Result<Option<ValueFactorSeries>, BacktestError> {
    let evaluator = factory.create(spec)?;
    if !evaluator.normalized() {
        if degrade_to_rel {
            warn!(
                cache_key = %spec.cache_key(),
                "value factor is not normalized, degrading DYN config to REL"
            );
            return Ok(None);
        }
        return Err(BacktestError::UnsupportedValueFactor(spec.cache_key()));
    }

    let points = evaluator.evaluate(sub_bars);
    let mut map = BTreeMap::new();
    for (candle, point) in sub_bars.iter().zip(points) {
        if point.value.is_finite() {
            map.insert(candle.bucket, point.value.clamp(0.0, 100.0));
        }
    }

    Ok(Some(ValueFactorSeries::from_points(map)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndicatorKind;
    use crate::pipeline::precalc::TaIndicatorFactory;

    fn parent(bucket: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new_unchecked(bucket, open, high, low, close, 500.0)
    }

    #[test]
    fn test_sub_bars_respect_parent_window() {
        let p = parent(3000, 100.0, 110.0, 98.0, 108.0);
        let subs = synthesize_sub_bars(&p, Timeframe::M5);
        assert_eq!(subs.len(), 5);

        for sub in &subs {
            assert!(sub.low >= p.low - 1e-9);
            assert!(sub.high <= p.high + 1e-9);
            assert!(sub.check().is_ok());
        }
        // strictly ascending buckets inside the parent window
        for w in subs.windows(2) {
            assert!(w[1].bucket > w[0].bucket);
        }
        assert_eq!(subs[0].bucket, 3000);
        assert!(subs.last().unwrap().bucket < 3000 + 300);
        assert_eq!(subs[0].open, p.open);
        assert_eq!(subs.last().unwrap().close, p.close);
    }

    #[test]
    fn test_bullish_path_touches_high() {
        let p = parent(0, 100.0, 110.0, 99.0, 108.0);
        let subs = synthesize_sub_bars(&p, Timeframe::M5);
        let max_price = subs.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        assert!((max_price - p.high).abs() < 1e-9);
    }

    #[test]
    fn test_bearish_path_touches_low() {
        let p = parent(0, 108.0, 110.0, 98.0, 100.0);
        let subs = synthesize_sub_bars(&p, Timeframe::M5);
        let min_price = subs.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        assert!((min_price - p.low).abs() < 1e-9);
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let p = parent(7200, 50.0, 55.0, 49.0, 52.0);
        let a = synthesize_sub_bars(&p, Timeframe::H1);
        let b = synthesize_sub_bars(&p, Timeframe::H1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_m1_has_no_sub_bars() {
        let p = parent(0, 100.0, 101.0, 99.0, 100.5);
        assert!(synthesize_sub_bars(&p, Timeframe::M1).is_empty());
    }

    #[test]
    fn test_value_factor_lookup_at_or_before() {
        let mut points = BTreeMap::new();
        points.insert(100, 80.0);
        points.insert(200, 20.0);
        let series = ValueFactorSeries::from_points(points);

        assert_eq!(series.lookup(99), None);
        assert_eq!(series.lookup(100), Some(80.0));
        assert_eq!(series.lookup(150), Some(80.0));
        assert_eq!(series.lookup(200), Some(20.0));
        assert_eq!(series.lookup(10_000), Some(20.0));
    }

    #[test]
    fn test_value_factor_rejects_non_normalized() {
        let spec = IndicatorSpec::new(IndicatorKind::EmaCross, Timeframe::M1)
            .with_param("fast", 3.0)
            .with_param("slow", 5.0);
        let candles: Vec<Candle> = (0..10)
            .map(|i| parent(i * 60, 100.0, 101.0, 99.0, 100.0))
            .collect();

        let err = precalc_value_factor(&spec, &TaIndicatorFactory, &candles, false);
        assert!(matches!(
            err,
            Err(BacktestError::UnsupportedValueFactor(_))
        ));

        // degraded call site falls back to REL
        let ok = precalc_value_factor(&spec, &TaIndicatorFactory, &candles, true).unwrap();
        assert!(ok.is_none());
    }

    #[test]
    fn test_value_factor_values_are_clamped() {
        let spec = IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M1)
            .with_param("period", 3.0)
            .with_param("threshold", 50.0);
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let px = 100.0 + i as f64;
                parent(i * 60, px, px + 0.5, px - 0.5, px)
            })
            .collect();

        let series = precalc_value_factor(&spec, &TaIndicatorFactory, &candles, false)
            .unwrap()
            .unwrap();
        assert!(!series.is_empty());
        for ts in candles.iter().map(|c| c.bucket) {
            if let Some(v) = series.lookup(ts) {
                assert!((0.0..=100.0).contains(&v));
            }
        }
    }
}
