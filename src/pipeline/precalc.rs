//! Indicator pre-calculation (stage one)
//!
//! Every unique indicator referenced by the strategy is evaluated once over
//! the full candle history at its native resolution, producing a boolean
//! signal array and a raw value array keyed by the indicator's cache key.
//! Configs that share a cache key collapse to a single evaluation.

use std::collections::HashMap;

use tracing::warn;

use crate::config::{IndicatorKind, IndicatorSpec, PriceSource};
use crate::data::aggregate_candles;
use crate::error::BacktestError;
use crate::indicators;
use crate::pipeline::resample::MIN_SIMULATION_RESOLUTION;
use crate::types::Candle;

/// One evaluated point: raw indicator value plus the boolean signal derived
/// from it.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorPoint {
    pub value: f64,
    pub signal: bool,
}

/// History an indicator needs before its output is defined.
#[derive(Debug, Clone, Copy)]
pub struct PointRequirements {
    /// Leading bars (at native resolution) with undefined output.
    pub min_periods: usize,
    /// Native bar stride in seconds.
    pub resolution_secs: i64,
}

/// A single evaluatable indicator produced by the factory.
pub trait IndicatorEvaluator: Send + Sync {
    fn cache_key(&self) -> String;

    fn point_requirements(&self) -> PointRequirements;

    /// True when the raw value is guaranteed to stay within 0-100. Only
    /// normalized indicators may serve as value factors for DYN stops.
    fn normalized(&self) -> bool {
        false
    }

    /// Evaluate over the full series; one point per candle. Warmup positions
    /// carry `signal = false` and a NaN value.
    fn evaluate(&self, candles: &[Candle]) -> Vec<IndicatorPoint>;
}

/// Builds evaluators from opaque indicator specs.
pub trait IndicatorFactory: Send + Sync {
    fn create(&self, spec: &IndicatorSpec) -> Result<Box<dyn IndicatorEvaluator>, BacktestError>;
}

/// Default factory backed by the `ta` wrappers in [`crate::indicators`].
#[derive(Debug, Default)]
pub struct TaIndicatorFactory;

impl IndicatorFactory for TaIndicatorFactory {
    fn create(&self, spec: &IndicatorSpec) -> Result<Box<dyn IndicatorEvaluator>, BacktestError> {
        let evaluator = TaEvaluator::from_spec(spec)?;
        Ok(Box::new(evaluator))
    }
}

/// Evaluator for every indicator family the default factory knows.
struct TaEvaluator {
    spec: IndicatorSpec,
    min_periods: usize,
    normalized: bool,
}

impl TaEvaluator {
    fn from_spec(spec: &IndicatorSpec) -> Result<Self, BacktestError> {
        let (min_periods, normalized) = match spec.kind {
            IndicatorKind::Rsi => (Self::period_param(spec, "period", 14.0)?, true),
            IndicatorKind::EmaCross | IndicatorKind::SmaCross => {
                let fast = Self::period_param(spec, "fast", 12.0)?;
                let slow = Self::period_param(spec, "slow", 26.0)?;
                if fast >= slow {
                    return Err(BacktestError::Indicator(format!(
                        "{}: fast period {} must be below slow period {}",
                        spec.cache_key(),
                        fast,
                        slow
                    )));
                }
                (slow, false)
            }
            IndicatorKind::MacdCross => {
                let fast = Self::period_param(spec, "fast", 12.0)?;
                let slow = Self::period_param(spec, "slow", 26.0)?;
                Self::period_param(spec, "signal", 9.0)?;
                if fast >= slow {
                    return Err(BacktestError::Indicator(format!(
                        "{}: fast period {} must be below slow period {}",
                        spec.cache_key(),
                        fast,
                        slow
                    )));
                }
                (slow, false)
            }
            IndicatorKind::BollingerBreak => (Self::period_param(spec, "period", 20.0)?, true),
            IndicatorKind::Stochastic => (Self::period_param(spec, "k_period", 14.0)?, true),
            IndicatorKind::Mfi => (Self::period_param(spec, "period", 14.0)?, true),
            IndicatorKind::WilliamsR => (Self::period_param(spec, "period", 14.0)?, true),
            IndicatorKind::PriceAbove | IndicatorKind::PriceBelow => {
                if spec.param("level").is_none() {
                    return Err(BacktestError::Indicator(format!(
                        "{}: missing 'level' parameter",
                        spec.cache_key()
                    )));
                }
                (1, false)
            }
        };

        Ok(TaEvaluator {
            spec: spec.clone(),
            min_periods,
            normalized,
        })
    }

    fn period_param(spec: &IndicatorSpec, name: &str, default: f64) -> Result<usize, BacktestError> {
        let raw = spec.param_or(name, default);
        if raw < 1.0 || raw.fract() != 0.0 {
            return Err(BacktestError::Indicator(format!(
                "{}: parameter '{}' must be a positive integer, got {}",
                spec.cache_key(),
                name,
                raw
            )));
        }
        Ok(raw as usize)
    }

    fn project(&self, candles: &[Candle]) -> Vec<f64> {
        candles
            .iter()
            .map(|c| match self.spec.source {
                PriceSource::Close => c.close,
                PriceSource::Open => c.open,
                PriceSource::High => c.high,
                PriceSource::Low => c.low,
                PriceSource::Typical => c.typical_price(),
            })
            .collect()
    }

    /// Threshold signal on an optional value series.
    fn threshold_points(&self, values: Vec<Option<f64>>, threshold: f64, below: bool) -> Vec<IndicatorPoint> {
        values
            .into_iter()
            .map(|v| match v {
                Some(v) if v.is_finite() => IndicatorPoint {
                    value: v,
                    signal: if below { v < threshold } else { v > threshold },
                },
                _ => IndicatorPoint {
                    value: f64::NAN,
                    signal: false,
                },
            })
            .collect()
    }

    /// Spread signal: true when `a > b`, value is the spread.
    fn spread_points(&self, a: Vec<Option<f64>>, b: Vec<Option<f64>>) -> Vec<IndicatorPoint> {
        a.into_iter()
            .zip(b)
            .map(|pair| match pair {
                (Some(a), Some(b)) if a.is_finite() && b.is_finite() => IndicatorPoint {
                    value: a - b,
                    signal: a > b,
                },
                _ => IndicatorPoint {
                    value: f64::NAN,
                    signal: false,
                },
            })
            .collect()
    }
}

impl IndicatorEvaluator for TaEvaluator {
    fn cache_key(&self) -> String {
        self.spec.cache_key()
    }

    fn point_requirements(&self) -> PointRequirements {
        PointRequirements {
            min_periods: self.min_periods,
            resolution_secs: self.spec.timeframe.secs(),
        }
    }

    fn normalized(&self) -> bool {
        self.normalized
    }

    fn evaluate(&self, candles: &[Candle]) -> Vec<IndicatorPoint> {
        let spec = &self.spec;
        let prices = self.project(candles);
        let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();

        match spec.kind {
            IndicatorKind::Rsi => {
                let period = spec.param_or("period", 14.0) as usize;
                let threshold = spec.param_or("threshold", 30.0);
                let below = spec.param_or("below", 1.0) != 0.0;
                self.threshold_points(indicators::rsi(&prices, period), threshold, below)
            }
            IndicatorKind::EmaCross => {
                let fast = spec.param_or("fast", 12.0) as usize;
                let slow = spec.param_or("slow", 26.0) as usize;
                self.spread_points(
                    indicators::ema(&prices, fast),
                    indicators::ema(&prices, slow),
                )
            }
            IndicatorKind::SmaCross => {
                let fast = spec.param_or("fast", 12.0) as usize;
                let slow = spec.param_or("slow", 26.0) as usize;
                self.spread_points(
                    indicators::sma(&prices, fast),
                    indicators::sma(&prices, slow),
                )
            }
            IndicatorKind::MacdCross => {
                let fast = spec.param_or("fast", 12.0) as usize;
                let slow = spec.param_or("slow", 26.0) as usize;
                let signal = spec.param_or("signal", 9.0) as usize;
                let (macd_line, signal_line) = indicators::macd(&prices, fast, slow, signal);
                self.spread_points(macd_line, signal_line)
            }
            IndicatorKind::BollingerBreak => {
                let period = spec.param_or("period", 20.0) as usize;
                let num_std = spec.param_or("num_std", 2.0);
                let upper = spec.param_or("upper", 1.0) != 0.0;
                let (ub, _, lb) = indicators::bollinger_bands(&prices, period, num_std);
                ub.into_iter()
                    .zip(lb)
                    .zip(prices)
                    .map(|((ub, lb), px)| match (ub, lb) {
                        (Some(ub), Some(lb)) if ub > lb => {
                            // %B clamped to 0-100 keeps the output normalized
                            let pct_b = ((px - lb) / (ub - lb) * 100.0).clamp(0.0, 100.0);
                            IndicatorPoint {
                                value: pct_b,
                                signal: if upper { px > ub } else { px < lb },
                            }
                        }
                        _ => IndicatorPoint {
                            value: f64::NAN,
                            signal: false,
                        },
                    })
                    .collect()
            }
            IndicatorKind::Stochastic => {
                let k_period = spec.param_or("k_period", 14.0) as usize;
                let threshold = spec.param_or("threshold", 20.0);
                let below = spec.param_or("below", 1.0) != 0.0;
                self.threshold_points(
                    indicators::stochastic_k(&high, &low, &close, k_period),
                    threshold,
                    below,
                )
            }
            IndicatorKind::Mfi => {
                let period = spec.param_or("period", 14.0) as usize;
                let threshold = spec.param_or("threshold", 20.0);
                let below = spec.param_or("below", 1.0) != 0.0;
                let volume: Vec<f64> = candles.iter().map(|c| c.volume).collect();
                self.threshold_points(
                    indicators::mfi(&high, &low, &close, &volume, period),
                    threshold,
                    below,
                )
            }
            IndicatorKind::WilliamsR => {
                let period = spec.param_or("period", 14.0) as usize;
                let threshold = spec.param_or("threshold", 20.0);
                let below = spec.param_or("below", 1.0) != 0.0;
                // shift -100..0 onto the normalized 0-100 scale
                let shifted: Vec<Option<f64>> =
                    indicators::williams_r(&high, &low, &close, period)
                        .into_iter()
                        .map(|v| v.map(|v| v + 100.0))
                        .collect();
                self.threshold_points(shifted, threshold, below)
            }
            IndicatorKind::PriceAbove => {
                let level = spec.param_or("level", 0.0);
                prices
                    .into_iter()
                    .map(|px| IndicatorPoint {
                        value: px,
                        signal: px > level,
                    })
                    .collect()
            }
            IndicatorKind::PriceBelow => {
                let level = spec.param_or("level", 0.0);
                prices
                    .into_iter()
                    .map(|px| IndicatorPoint {
                        value: px,
                        signal: px < level,
                    })
                    .collect()
            }
        }
    }
}

/// Signal and raw-value arrays for one unique indicator at its native
/// resolution. Immutable once built.
#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub cache_key: String,
    pub resolution_secs: i64,
    pub timestamps: Vec<i64>,
    pub signals: Vec<bool>,
    /// NaN where the indicator has no defined output.
    pub values: Vec<f64>,
    pub normalized: bool,
    pub min_periods: usize,
}

/// Output of the pre-calculation stage.
#[derive(Debug, Clone, Default)]
pub struct PrecalcOutput {
    pub series: HashMap<String, IndicatorSeries>,
    /// Largest warmup requirement across indicators, expressed in
    /// [`MIN_SIMULATION_RESOLUTION`] units.
    pub warmup_candles: usize,
}

impl PrecalcOutput {
    pub fn min_native_resolution(&self) -> Option<i64> {
        self.series.values().map(|s| s.resolution_secs).min()
    }
}

/// Evaluate all unique indicators over the candle history.
pub fn precalculate(
    candles: &[Candle],
    specs: &[&IndicatorSpec],
    factory: &dyn IndicatorFactory,
) -> Result<PrecalcOutput, BacktestError> {
    let mut output = PrecalcOutput::default();

    for spec in specs {
        let key = spec.cache_key();
        if output.series.contains_key(&key) {
            continue;
        }

        let evaluator = factory.create(spec)?;
        let reqs = evaluator.point_requirements();
        let native = aggregate_candles(candles, reqs.resolution_secs);
        let points = evaluator.evaluate(&native);

        let (signals, values) = if points.len() == native.len() {
            points
                .into_iter()
                .map(|p| {
                    if p.value.is_finite() {
                        (p.signal, p.value)
                    } else {
                        (false, f64::NAN)
                    }
                })
                .unzip()
        } else {
            // a misbehaving indicator yields no signal at all
            warn!(
                cache_key = %key,
                expected = native.len(),
                got = points.len(),
                "indicator returned wrong output length, treating as all-false"
            );
            (vec![false; native.len()], vec![f64::NAN; native.len()])
        };

        let warmup_units = ((reqs.min_periods as i64 * reqs.resolution_secs) as u64)
            .div_ceil(MIN_SIMULATION_RESOLUTION as u64) as usize;
        output.warmup_candles = output.warmup_candles.max(warmup_units);

        output.series.insert(
            key.clone(),
            IndicatorSeries {
                cache_key: key,
                resolution_secs: reqs.resolution_secs,
                timestamps: native.iter().map(|c| c.bucket).collect(),
                signals,
                values,
                normalized: evaluator.normalized(),
                min_periods: reqs.min_periods,
            },
        );
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn minute_candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new_unchecked(i as i64 * 60, c, c + 0.5, c - 0.5, c, 100.0))
            .collect()
    }

    #[test]
    fn test_duplicate_specs_collapse() {
        let candles = minute_candles(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let spec = IndicatorSpec::new(IndicatorKind::PriceAbove, Timeframe::M1)
            .with_param("level", 102.0);
        let dup = spec.clone();
        let out = precalculate(&candles, &[&spec, &dup], &TaIndicatorFactory).unwrap();
        assert_eq!(out.series.len(), 1);
    }

    #[test]
    fn test_price_above_signals() {
        let candles = minute_candles(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let spec = IndicatorSpec::new(IndicatorKind::PriceAbove, Timeframe::M1)
            .with_param("level", 102.0);
        let out = precalculate(&candles, &[&spec], &TaIndicatorFactory).unwrap();
        let series = &out.series[&spec.cache_key()];
        assert_eq!(series.signals, vec![false, false, false, true, true]);
    }

    #[test]
    fn test_warmup_positions_are_false() {
        let candles = minute_candles(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let spec = IndicatorSpec::new(IndicatorKind::SmaCross, Timeframe::M1)
            .with_param("fast", 2.0)
            .with_param("slow", 4.0);
        let out = precalculate(&candles, &[&spec], &TaIndicatorFactory).unwrap();
        let series = &out.series[&spec.cache_key()];
        assert!(!series.signals[0]);
        assert!(!series.signals[2]);
        // rising series: fast SMA above slow SMA once both are defined
        assert!(series.signals[4]);
        assert!(series.signals[5]);
    }

    #[test]
    fn test_warmup_candles_accounts_for_resolution() {
        let closes: Vec<f64> = (0..600).map(|i| 100.0 + i as f64 * 0.01).collect();
        let candles = minute_candles(&closes);
        let spec = IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M5)
            .with_param("period", 14.0)
            .with_param("threshold", 70.0)
            .with_param("below", 0.0);
        let out = precalculate(&candles, &[&spec], &TaIndicatorFactory).unwrap();
        // 14 periods at 5m = 70 minutes of history
        assert_eq!(out.warmup_candles, 70);
    }

    #[test]
    fn test_factory_rejects_bad_params() {
        let spec = IndicatorSpec::new(IndicatorKind::EmaCross, Timeframe::M1)
            .with_param("fast", 26.0)
            .with_param("slow", 12.0);
        assert!(TaIndicatorFactory.create(&spec).is_err());

        let spec = IndicatorSpec::new(IndicatorKind::PriceAbove, Timeframe::M1);
        assert!(TaIndicatorFactory.create(&spec).is_err());
    }

    #[test]
    fn test_normalized_flags() {
        let rsi = IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M1);
        assert!(TaIndicatorFactory.create(&rsi).unwrap().normalized());

        let ema = IndicatorSpec::new(IndicatorKind::EmaCross, Timeframe::M1)
            .with_param("fast", 9.0)
            .with_param("slow", 21.0);
        assert!(!TaIndicatorFactory.create(&ema).unwrap().normalized());
    }
}
