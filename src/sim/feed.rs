//! Backtest indicator feed
//!
//! Read-only view over the resampled signal streams, positioned on one
//! simulation bar at a time. Condition evaluation and the edge rule both
//! derive from the same arrays, so "previous" always means the condition
//! evaluated on the prior bar, no matter when it was last asked for.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::warn;

use crate::config::AlgoParams;
use crate::pipeline::resample::ResampledSignals;
use crate::ports::IndicatorFeedPort;
use crate::types::{ConditionSnapshot, ConditionType};

/// Cache keys backing one condition.
#[derive(Debug, Clone, Default)]
pub struct ConditionKeys {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

pub struct BacktestSignalFeed {
    signals: HashMap<String, Vec<bool>>,
    values: HashMap<String, Vec<f64>>,
    timestamps: Vec<i64>,
    conditions: HashMap<ConditionType, ConditionKeys>,
    current_bar: usize,
    /// Unknown cache keys are logged once, then read as false.
    warned_keys: Mutex<HashSet<String>>,
}

impl BacktestSignalFeed {
    pub fn new(resampled: ResampledSignals, params: &AlgoParams) -> Self {
        let mut conditions = HashMap::new();
        let pairs = [
            (ConditionType::LongEntry, &params.long_entry),
            (ConditionType::LongExit, &params.long_exit),
            (ConditionType::ShortEntry, &params.short_entry),
            (ConditionType::ShortExit, &params.short_exit),
        ];
        for (condition, cond) in pairs {
            if let Some(cond) = cond {
                conditions.insert(
                    condition,
                    ConditionKeys {
                        required: cond.required.iter().map(|s| s.cache_key()).collect(),
                        optional: cond.optional.iter().map(|s| s.cache_key()).collect(),
                    },
                );
            }
        }

        BacktestSignalFeed {
            signals: resampled.signals,
            values: resampled.values,
            timestamps: resampled.grid.timestamps,
            conditions,
            current_bar: 0,
            warned_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    fn signal_at(&self, cache_key: &str, bar: usize) -> bool {
        match self.signals.get(cache_key) {
            Some(series) => series.get(bar).copied().unwrap_or(false),
            None => {
                let mut warned = self.warned_keys.lock().expect("warned-keys lock");
                if warned.insert(cache_key.to_string()) {
                    warn!(cache_key, "unknown signal cache key, reading as false");
                }
                false
            }
        }
    }

    fn condition_met_at(&self, condition: ConditionType, bar: usize) -> bool {
        let keys = match self.conditions.get(&condition) {
            Some(keys) => keys,
            None => return false,
        };
        let required_ok = keys.required.iter().all(|k| self.signal_at(k, bar));
        let optional_ok =
            keys.optional.is_empty() || keys.optional.iter().any(|k| self.signal_at(k, bar));
        required_ok && optional_ok
    }

    fn snapshot_at(&self, condition: ConditionType, bar: usize) -> ConditionSnapshot {
        let keys = self.conditions.get(&condition).cloned().unwrap_or_default();
        let required_true = keys
            .required
            .iter()
            .filter(|k| self.signal_at(k, bar))
            .count();
        let optional_true = keys
            .optional
            .iter()
            .filter(|k| self.signal_at(k, bar))
            .count();
        let required_total = keys.required.len();
        let optional_total = keys.optional.len();
        let condition_met = required_total > 0
            && required_true == required_total
            && (optional_total == 0 || optional_true > 0);

        // no optional term when none are configured
        let optional_missing = usize::from(optional_total > 0 && optional_true == 0);
        let distance_from_trigger =
            required_total.saturating_sub(required_true) + optional_missing;

        ConditionSnapshot {
            required_true,
            required_total,
            optional_true,
            optional_total,
            condition_met,
            distance_from_trigger,
        }
    }
}

impl IndicatorFeedPort for BacktestSignalFeed {
    fn set_current_bar(&mut self, bar_index: usize) {
        self.current_bar = bar_index;
    }

    fn get_current_signals(&self) -> HashMap<String, bool> {
        self.signals
            .keys()
            .map(|k| (k.clone(), self.signal_at(k, self.current_bar)))
            .collect()
    }

    fn get_signal(&self, cache_key: &str) -> bool {
        self.signal_at(cache_key, self.current_bar)
    }

    fn get_raw_value(&self, cache_key: &str) -> Option<f64> {
        self.values
            .get(cache_key)
            .and_then(|series| series.get(self.current_bar))
            .copied()
            .filter(|v| v.is_finite())
    }

    fn evaluate_condition(&self, condition: ConditionType) -> bool {
        self.condition_met_at(condition, self.current_bar)
    }

    fn get_condition_snapshot(&self, condition: ConditionType) -> ConditionSnapshot {
        self.snapshot_at(condition, self.current_bar)
    }

    fn get_indicators_for_condition(&self, condition: ConditionType) -> Vec<String> {
        match self.conditions.get(&condition) {
            Some(keys) => keys
                .required
                .iter()
                .chain(keys.optional.iter())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn get_previous_condition_met(&self, condition: ConditionType) -> bool {
        if self.current_bar == 0 {
            return false;
        }
        self.condition_met_at(condition, self.current_bar - 1)
    }

    fn get_total_bars(&self) -> usize {
        self.timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AlgoCondition, AlgoType, IndicatorKind, IndicatorSpec, OrderKind, TimeoutConfig,
        ValueConfig,
    };
    use crate::pipeline::resample::SimulationGrid;
    use crate::types::Timeframe;

    fn spec(level: f64) -> IndicatorSpec {
        IndicatorSpec::new(IndicatorKind::PriceAbove, Timeframe::M1).with_param("level", level)
    }

    fn feed_with(signals: Vec<(String, Vec<bool>)>, params: &AlgoParams) -> BacktestSignalFeed {
        let n = signals.first().map(|(_, s)| s.len()).unwrap_or(0);
        let resampled = ResampledSignals {
            grid: SimulationGrid {
                resolution_secs: 60,
                timestamps: (0..n as i64).map(|i| i * 60).collect(),
                warmup_bars: 0,
            },
            signals: signals.into_iter().collect(),
            values: HashMap::new(),
        };
        BacktestSignalFeed::new(resampled, params)
    }

    fn params_with_entry(required: Vec<IndicatorSpec>, optional: Vec<IndicatorSpec>) -> AlgoParams {
        AlgoParams {
            algo_type: AlgoType::Long,
            coin_symbol: "BTC".to_string(),
            starting_capital_usd: 10_000.0,
            position_size: ValueConfig::rel(0.1),
            order_type: OrderKind::Market,
            long_entry: Some(AlgoCondition {
                required,
                optional,
                stop_loss: None,
                take_profit: None,
                trailing_sl: false,
            }),
            long_exit: None,
            short_entry: None,
            short_exit: None,
            timeout: TimeoutConfig::default(),
            assume_position_immediately: false,
        }
    }

    #[test]
    fn test_condition_requires_all_required() {
        let a = spec(1.0);
        let b = spec(2.0);
        let params = params_with_entry(vec![a.clone(), b.clone()], vec![]);
        let mut feed = feed_with(
            vec![
                (a.cache_key(), vec![true, true]),
                (b.cache_key(), vec![false, true]),
            ],
            &params,
        );

        feed.set_current_bar(0);
        assert!(!feed.evaluate_condition(ConditionType::LongEntry));
        feed.set_current_bar(1);
        assert!(feed.evaluate_condition(ConditionType::LongEntry));
    }

    #[test]
    fn test_optional_needs_at_least_one() {
        let a = spec(1.0);
        let o1 = spec(2.0);
        let o2 = spec(3.0);
        let params = params_with_entry(vec![a.clone()], vec![o1.clone(), o2.clone()]);
        let mut feed = feed_with(
            vec![
                (a.cache_key(), vec![true, true]),
                (o1.cache_key(), vec![false, true]),
                (o2.cache_key(), vec![false, false]),
            ],
            &params,
        );

        feed.set_current_bar(0);
        assert!(!feed.evaluate_condition(ConditionType::LongEntry));
        let snap = feed.get_condition_snapshot(ConditionType::LongEntry);
        assert_eq!(snap.distance_from_trigger, 1);

        feed.set_current_bar(1);
        assert!(feed.evaluate_condition(ConditionType::LongEntry));
        let snap = feed.get_condition_snapshot(ConditionType::LongEntry);
        assert_eq!(snap.distance_from_trigger, 0);
        assert_eq!(snap.optional_true, 1);
    }

    #[test]
    fn test_distance_without_optional_has_no_extra_term() {
        let a = spec(1.0);
        let b = spec(2.0);
        let params = params_with_entry(vec![a.clone(), b.clone()], vec![]);
        let feed = feed_with(
            vec![
                (a.cache_key(), vec![false]),
                (b.cache_key(), vec![false]),
            ],
            &params,
        );

        let snap = feed.get_condition_snapshot(ConditionType::LongEntry);
        assert_eq!(snap.distance_from_trigger, 2);
        assert_eq!(snap.optional_total, 0);
    }

    #[test]
    fn test_previous_met_uses_prior_bar() {
        let a = spec(1.0);
        let params = params_with_entry(vec![a.clone()], vec![]);
        let mut feed = feed_with(vec![(a.cache_key(), vec![false, true, true])], &params);

        feed.set_current_bar(1);
        assert!(feed.evaluate_condition(ConditionType::LongEntry));
        assert!(!feed.get_previous_condition_met(ConditionType::LongEntry));

        feed.set_current_bar(2);
        assert!(feed.get_previous_condition_met(ConditionType::LongEntry));
    }

    #[test]
    fn test_unknown_key_reads_false() {
        let a = spec(1.0);
        let params = params_with_entry(vec![a], vec![]);
        let feed = feed_with(vec![], &params);
        assert!(!feed.get_signal("nope@1m"));
        // condition with an unknown key can never fire
        assert!(!feed.evaluate_condition(ConditionType::LongEntry));
    }

    #[test]
    fn test_unconfigured_condition_is_false() {
        let a = spec(1.0);
        let params = params_with_entry(vec![a.clone()], vec![]);
        let feed = feed_with(vec![(a.cache_key(), vec![true])], &params);
        assert!(!feed.evaluate_condition(ConditionType::ShortEntry));
        let snap = feed.get_condition_snapshot(ConditionType::ShortEntry);
        assert_eq!(snap.required_total, 0);
        assert!(!snap.condition_met);
    }
}
