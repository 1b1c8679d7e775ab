//! Special indicators: stop-loss, take-profit, trailing stop
//!
//! Instantiated when a position opens, fed the intrabar price path once per
//! parent bar, and queried for triggers. The execution price of a trigger is
//! the level itself, modelling a resting protective order. DYN levels are
//! scaled by a normalized value-factor looked up at sub-bar timestamps;
//! when the factor has no value yet, the level falls back to plain REL.

use std::sync::Arc;

use crate::config::{ValueConfig, ValueType};
use crate::pipeline::subbar::ValueFactorSeries;
use crate::types::TradeDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialIndicatorKind {
    TrailingStop,
    StopLoss,
    TakeProfit,
}

impl SpecialIndicatorKind {
    /// Lower value wins when several triggers fire on the same bar.
    pub fn priority(self) -> u8 {
        match self {
            SpecialIndicatorKind::TrailingStop => 0,
            SpecialIndicatorKind::StopLoss => 1,
            SpecialIndicatorKind::TakeProfit => 2,
        }
    }
}

/// Turns a [`ValueConfig`] into concrete price levels for one direction.
#[derive(Debug, Clone)]
pub struct LevelPolicy {
    cfg: ValueConfig,
    direction: TradeDirection,
    factor: Option<Arc<ValueFactorSeries>>,
}

impl LevelPolicy {
    pub fn new(
        cfg: ValueConfig,
        direction: TradeDirection,
        factor: Option<Arc<ValueFactorSeries>>,
    ) -> Self {
        LevelPolicy {
            cfg,
            direction,
            factor,
        }
    }

    /// Relative distance for REL/DYN configs at time `t`.
    fn fraction_at(&self, t: i64) -> f64 {
        match self.cfg.value_type {
            ValueType::Rel | ValueType::Abs => self.cfg.value,
            ValueType::Dyn => match self.factor.as_ref().and_then(|f| f.lookup(t)) {
                Some(v) => {
                    let scale = if self.cfg.inverted {
                        (100.0 - v) / 100.0
                    } else {
                        v / 100.0
                    };
                    self.cfg.value * scale
                }
                // undefined factor: degrade to REL semantics
                None => self.cfg.value,
            },
        }
    }

    /// Level on the adverse side of the entry (stop-loss / trailing base).
    pub fn protective_level(&self, entry_price: f64, t: i64) -> f64 {
        match (self.cfg.value_type, self.direction) {
            (ValueType::Abs, TradeDirection::Long) => entry_price - self.cfg.value,
            (ValueType::Abs, TradeDirection::Short) => entry_price + self.cfg.value,
            (_, TradeDirection::Long) => entry_price * (1.0 - self.fraction_at(t)),
            (_, TradeDirection::Short) => entry_price * (1.0 + self.fraction_at(t)),
        }
    }

    /// Level on the favorable side of the entry (take-profit).
    pub fn profit_level(&self, entry_price: f64, t: i64) -> f64 {
        match (self.cfg.value_type, self.direction) {
            (ValueType::Abs, TradeDirection::Long) => entry_price + self.cfg.value,
            (ValueType::Abs, TradeDirection::Short) => entry_price - self.cfg.value,
            (_, TradeDirection::Long) => entry_price * (1.0 + self.fraction_at(t)),
            (_, TradeDirection::Short) => entry_price * (1.0 - self.fraction_at(t)),
        }
    }

    /// Trailing level anchored to the running peak (LONG) or trough (SHORT).
    pub fn trailing_level(&self, anchor: f64, t: i64) -> f64 {
        match (self.cfg.value_type, self.direction) {
            (ValueType::Abs, TradeDirection::Long) => anchor - self.cfg.value,
            (ValueType::Abs, TradeDirection::Short) => anchor + self.cfg.value,
            (_, TradeDirection::Long) => anchor * (1.0 - self.fraction_at(t)),
            (_, TradeDirection::Short) => anchor * (1.0 + self.fraction_at(t)),
        }
    }

    pub fn direction(&self) -> TradeDirection {
        self.direction
    }
}

/// A protective indicator attached to an open position.
pub trait SpecialIndicator: Send {
    fn kind(&self) -> SpecialIndicatorKind;

    /// Re-seed for a fresh position.
    fn reset(&mut self, entry_price: f64, entry_time: i64);

    /// Feed the intrabar price path for one parent bar. Prices and times
    /// run in chronological order; the first crossing latches the trigger.
    fn calculate(&mut self, prices: &[f64], times: &[i64]);

    fn is_triggered(&self) -> bool;

    fn get_level(&self) -> f64;

    /// Sub-bar price that crossed the level, for diagnostics.
    fn trigger_price(&self) -> Option<f64>;

    /// Level changed during the last `calculate` call (DYN recompute or
    /// trailing ratchet).
    fn level_moved(&self) -> bool;
}

/// Fixed (or DYN-scaled) stop on the adverse side of the entry.
pub struct StopLoss {
    policy: LevelPolicy,
    entry_price: f64,
    level: f64,
    triggered: bool,
    trigger_price: Option<f64>,
    moved: bool,
}

impl StopLoss {
    pub fn new(policy: LevelPolicy) -> Self {
        StopLoss {
            policy,
            entry_price: 0.0,
            level: 0.0,
            triggered: false,
            trigger_price: None,
            moved: false,
        }
    }
}

impl SpecialIndicator for StopLoss {
    fn kind(&self) -> SpecialIndicatorKind {
        SpecialIndicatorKind::StopLoss
    }

    fn reset(&mut self, entry_price: f64, entry_time: i64) {
        self.entry_price = entry_price;
        self.level = self.policy.protective_level(entry_price, entry_time);
        self.triggered = false;
        self.trigger_price = None;
        self.moved = false;
    }

    fn calculate(&mut self, prices: &[f64], times: &[i64]) {
        self.moved = false;
        if self.triggered {
            return;
        }
        for (&price, &t) in prices.iter().zip(times) {
            let level = self.policy.protective_level(self.entry_price, t);
            if (level - self.level).abs() > f64::EPSILON {
                self.level = level;
                self.moved = true;
            }
            let crossed = match self.policy.direction() {
                TradeDirection::Long => price <= self.level,
                TradeDirection::Short => price >= self.level,
            };
            if crossed {
                self.triggered = true;
                self.trigger_price = Some(price);
                return;
            }
        }
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }

    fn get_level(&self) -> f64 {
        self.level
    }

    fn trigger_price(&self) -> Option<f64> {
        self.trigger_price
    }

    fn level_moved(&self) -> bool {
        self.moved
    }
}

/// Fixed (or DYN-scaled) target on the favorable side of the entry.
pub struct TakeProfit {
    policy: LevelPolicy,
    entry_price: f64,
    level: f64,
    triggered: bool,
    trigger_price: Option<f64>,
    moved: bool,
}

impl TakeProfit {
    pub fn new(policy: LevelPolicy) -> Self {
        TakeProfit {
            policy,
            entry_price: 0.0,
            level: 0.0,
            triggered: false,
            trigger_price: None,
            moved: false,
        }
    }
}

impl SpecialIndicator for TakeProfit {
    fn kind(&self) -> SpecialIndicatorKind {
        SpecialIndicatorKind::TakeProfit
    }

    fn reset(&mut self, entry_price: f64, entry_time: i64) {
        self.entry_price = entry_price;
        self.level = self.policy.profit_level(entry_price, entry_time);
        self.triggered = false;
        self.trigger_price = None;
        self.moved = false;
    }

    fn calculate(&mut self, prices: &[f64], times: &[i64]) {
        self.moved = false;
        if self.triggered {
            return;
        }
        for (&price, &t) in prices.iter().zip(times) {
            let level = self.policy.profit_level(self.entry_price, t);
            if (level - self.level).abs() > f64::EPSILON {
                self.level = level;
                self.moved = true;
            }
            let crossed = match self.policy.direction() {
                TradeDirection::Long => price >= self.level,
                TradeDirection::Short => price <= self.level,
            };
            if crossed {
                self.triggered = true;
                self.trigger_price = Some(price);
                return;
            }
        }
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }

    fn get_level(&self) -> f64 {
        self.level
    }

    fn trigger_price(&self) -> Option<f64> {
        self.trigger_price
    }

    fn level_moved(&self) -> bool {
        self.moved
    }
}

/// Ratcheting stop that follows the best price seen since entry. The level
/// only ever tightens; it never moves adverse.
pub struct TrailingStop {
    policy: LevelPolicy,
    anchor: f64,
    level: f64,
    triggered: bool,
    trigger_price: Option<f64>,
    moved: bool,
}

impl TrailingStop {
    pub fn new(policy: LevelPolicy) -> Self {
        TrailingStop {
            policy,
            anchor: 0.0,
            level: 0.0,
            triggered: false,
            trigger_price: None,
            moved: false,
        }
    }
}

impl SpecialIndicator for TrailingStop {
    fn kind(&self) -> SpecialIndicatorKind {
        SpecialIndicatorKind::TrailingStop
    }

    fn reset(&mut self, entry_price: f64, entry_time: i64) {
        self.anchor = entry_price;
        self.level = self.policy.trailing_level(entry_price, entry_time);
        self.triggered = false;
        self.trigger_price = None;
        self.moved = false;
    }

    fn calculate(&mut self, prices: &[f64], times: &[i64]) {
        self.moved = false;
        if self.triggered {
            return;
        }
        for (&price, &t) in prices.iter().zip(times) {
            // ratchet before checking: a new extreme on this sub-bar
            // tightens the level that the same sub-bar is tested against
            match self.policy.direction() {
                TradeDirection::Long => {
                    if price > self.anchor {
                        self.anchor = price;
                    }
                    let candidate = self.policy.trailing_level(self.anchor, t);
                    if candidate > self.level {
                        self.level = candidate;
                        self.moved = true;
                    }
                    if price <= self.level {
                        self.triggered = true;
                        self.trigger_price = Some(price);
                        return;
                    }
                }
                TradeDirection::Short => {
                    if price < self.anchor {
                        self.anchor = price;
                    }
                    let candidate = self.policy.trailing_level(self.anchor, t);
                    if candidate < self.level {
                        self.level = candidate;
                        self.moved = true;
                    }
                    if price >= self.level {
                        self.triggered = true;
                        self.trigger_price = Some(price);
                        return;
                    }
                }
            }
        }
    }

    fn is_triggered(&self) -> bool {
        self.triggered
    }

    fn get_level(&self) -> f64 {
        self.level
    }

    fn trigger_price(&self) -> Option<f64> {
        self.trigger_price
    }

    fn level_moved(&self) -> bool {
        self.moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rel_policy(value: f64, direction: TradeDirection) -> LevelPolicy {
        LevelPolicy::new(ValueConfig::rel(value), direction, None)
    }

    #[test]
    fn test_stop_loss_executes_at_level() {
        // LONG at 100, SL 2% -> 98. Path dips to 97.9; trigger price is the
        // crossing sub-bar price but the level stays 98.
        let mut sl = StopLoss::new(rel_policy(0.02, TradeDirection::Long));
        sl.reset(100.0, 0);
        assert!((sl.get_level() - 98.0).abs() < 1e-9);

        sl.calculate(&[99.5, 97.9, 102.0], &[0, 60, 120]);
        assert!(sl.is_triggered());
        assert_eq!(sl.trigger_price(), Some(97.9));
        assert!((sl.get_level() - 98.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_loss_short_direction() {
        let mut sl = StopLoss::new(rel_policy(0.02, TradeDirection::Short));
        sl.reset(100.0, 0);
        assert!((sl.get_level() - 102.0).abs() < 1e-9);

        sl.calculate(&[100.5, 101.9], &[0, 60]);
        assert!(!sl.is_triggered());
        sl.calculate(&[102.3], &[120]);
        assert!(sl.is_triggered());
    }

    #[test]
    fn test_take_profit_long() {
        let mut tp = TakeProfit::new(rel_policy(0.03, TradeDirection::Long));
        tp.reset(100.0, 0);
        assert!((tp.get_level() - 103.0).abs() < 1e-9);

        tp.calculate(&[101.0, 102.9], &[0, 60]);
        assert!(!tp.is_triggered());
        tp.calculate(&[103.2], &[120]);
        assert!(tp.is_triggered());
    }

    #[test]
    fn test_abs_levels() {
        let policy = LevelPolicy::new(ValueConfig::abs(5.0), TradeDirection::Long, None);
        assert!((policy.protective_level(100.0, 0) - 95.0).abs() < 1e-9);
        assert!((policy.profit_level(100.0, 0) - 105.0).abs() < 1e-9);

        let short = LevelPolicy::new(ValueConfig::abs(5.0), TradeDirection::Short, None);
        assert!((short.protective_level(100.0, 0) - 105.0).abs() < 1e-9);
        assert!((short.profit_level(100.0, 0) - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_ratchets_and_triggers_at_level() {
        // LONG at 100 with a 2% trail; peak 105 puts the level at 102.9
        let mut ts = TrailingStop::new(rel_policy(0.02, TradeDirection::Long));
        ts.reset(100.0, 0);
        assert!((ts.get_level() - 98.0).abs() < 1e-9);

        ts.calculate(
            &[100.0, 105.0, 104.0, 103.0, 102.9, 100.91],
            &[0, 60, 120, 180, 240, 300],
        );
        assert!(ts.is_triggered());
        assert!((ts.get_level() - 102.9).abs() < 1e-9);
        assert_eq!(ts.trigger_price(), Some(102.9));
    }

    #[test]
    fn test_trailing_never_moves_adverse() {
        let mut ts = TrailingStop::new(rel_policy(0.02, TradeDirection::Long));
        ts.reset(100.0, 0);
        ts.calculate(&[104.0], &[0]);
        let level_after_peak = ts.get_level();
        ts.calculate(&[102.5], &[60]);
        assert_eq!(ts.get_level(), level_after_peak);
    }

    #[test]
    fn test_dyn_level_with_inverted_factor() {
        // entry 100, value 0.05, RSI-style factor: 80 at entry, 20 later.
        // inverted: offset = 0.05 * (100 - v) / 100
        let mut points = BTreeMap::new();
        points.insert(0, 80.0);
        points.insert(600, 20.0);
        let factor = Arc::new(ValueFactorSeries::from_points(points));

        let cfg = ValueConfig {
            value_type: ValueType::Dyn,
            value: 0.05,
            value_factor: None,
            inverted: true,
        };
        let policy = LevelPolicy::new(cfg, TradeDirection::Long, Some(factor));

        // factor 80 -> offset 0.01 -> level 99
        assert!((policy.protective_level(100.0, 0) - 99.0).abs() < 1e-9);
        // factor 20 -> offset 0.04 -> level 96
        assert!((policy.protective_level(100.0, 600) - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_dyn_without_factor_falls_back_to_rel() {
        let cfg = ValueConfig {
            value_type: ValueType::Dyn,
            value: 0.05,
            value_factor: None,
            inverted: false,
        };
        let policy = LevelPolicy::new(cfg, TradeDirection::Long, None);
        assert!((policy.protective_level(100.0, 0) - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_dyn_stop_recomputes_midflight() {
        let mut points = BTreeMap::new();
        points.insert(0, 100.0);
        points.insert(60, 50.0);
        let factor = Arc::new(ValueFactorSeries::from_points(points));
        let cfg = ValueConfig {
            value_type: ValueType::Dyn,
            value: 0.04,
            value_factor: None,
            inverted: false,
        };
        let mut sl = StopLoss::new(LevelPolicy::new(cfg, TradeDirection::Long, Some(factor)));
        sl.reset(100.0, 0);
        // factor 100 -> full 4% offset
        assert!((sl.get_level() - 96.0).abs() < 1e-9);

        sl.calculate(&[99.0], &[60]);
        // factor 50 -> 2% offset; level recomputed and flagged as moved
        assert!((sl.get_level() - 98.0).abs() < 1e-9);
        assert!(sl.level_moved());
    }
}
