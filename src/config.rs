//! Backtest configuration
//!
//! Handles loading and validation of JSON strategy definitions: entry/exit
//! conditions, position sizing, stop policies, timeout rules, and run
//! settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::BacktestError;
use crate::types::Timeframe;

/// Price projection an indicator is evaluated on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    #[default]
    Close,
    Open,
    High,
    Low,
    Typical,
}

/// Indicator families the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    /// RSI vs. threshold. Params: `period`, `threshold`, `below` (0/1).
    Rsi,
    /// Fast EMA above slow EMA. Params: `fast`, `slow`.
    EmaCross,
    /// Fast SMA above slow SMA. Params: `fast`, `slow`.
    SmaCross,
    /// MACD line above its signal line. Params: `fast`, `slow`, `signal`.
    MacdCross,
    /// Close beyond a Bollinger band. Params: `period`, `num_std`,
    /// `upper` (0/1).
    BollingerBreak,
    /// Stochastic %K vs. threshold. Params: `k_period`, `d_period`,
    /// `threshold`, `below` (0/1).
    Stochastic,
    /// Money Flow Index vs. threshold. Params: `period`, `threshold`,
    /// `below` (0/1).
    Mfi,
    /// Williams %R (shifted to 0-100) vs. threshold. Params: `period`,
    /// `threshold`, `below` (0/1).
    WilliamsR,
    /// Close above a fixed price level. Params: `level`.
    PriceAbove,
    /// Close below a fixed price level. Params: `level`.
    PriceBelow,
}

impl IndicatorKind {
    pub fn tag(self) -> &'static str {
        match self {
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::EmaCross => "ema_cross",
            IndicatorKind::SmaCross => "sma_cross",
            IndicatorKind::MacdCross => "macd_cross",
            IndicatorKind::BollingerBreak => "bollinger_break",
            IndicatorKind::Stochastic => "stochastic",
            IndicatorKind::Mfi => "mfi",
            IndicatorKind::WilliamsR => "williams_r",
            IndicatorKind::PriceAbove => "price_above",
            IndicatorKind::PriceBelow => "price_below",
        }
    }
}

/// One indicator instance inside a condition.
///
/// The parameter map is ordered so that the derived cache key is stable and
/// content-addressed: two configs with the same kind, timeframe, source, and
/// parameters collapse to one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub kind: IndicatorKind,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub source: PriceSource,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl IndicatorSpec {
    pub fn new(kind: IndicatorKind, timeframe: Timeframe) -> Self {
        IndicatorSpec {
            kind,
            timeframe,
            source: PriceSource::default(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_source(mut self, source: PriceSource) -> Self {
        self.source = source;
        self
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    pub fn param_or(&self, name: &str, default: f64) -> f64 {
        self.param(name).unwrap_or(default)
    }

    /// Stable content-derived key for signal cache lookup and deduplication.
    pub fn cache_key(&self) -> String {
        let mut key = format!(
            "{}@{}:{:?}",
            self.kind.tag(),
            self.timeframe.label(),
            self.source
        )
        .to_lowercase();
        for (name, value) in &self.params {
            let _ = write!(key, ":{}={}", name, value);
        }
        key
    }
}

/// How a configured value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// Absolute USD (sizing) or absolute price offset (stops).
    Abs,
    /// Fraction of the reference: capital for sizing, entry price for stops.
    Rel,
    /// `value` scaled by a normalized (0-100) value-factor indicator.
    Dyn,
}

/// A sized value: position size, stop-loss distance, take-profit distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueConfig {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: f64,
    /// Normalized indicator scaling a DYN value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_factor: Option<IndicatorSpec>,
    /// Scale by `(100 - v) / 100` instead of `v / 100`.
    #[serde(default)]
    pub inverted: bool,
}

impl ValueConfig {
    pub fn abs(value: f64) -> Self {
        ValueConfig {
            value_type: ValueType::Abs,
            value,
            value_factor: None,
            inverted: false,
        }
    }

    pub fn rel(value: f64) -> Self {
        ValueConfig {
            value_type: ValueType::Rel,
            value,
            value_factor: None,
            inverted: false,
        }
    }

    pub fn dyn_factor(value: f64, factor: IndicatorSpec, inverted: bool) -> Self {
        ValueConfig {
            value_type: ValueType::Dyn,
            value,
            value_factor: Some(factor),
            inverted,
        }
    }
}

/// A compound entry or exit condition.
///
/// Met iff every `required` indicator signals true and, when `optional` is
/// non-empty, at least one optional indicator signals true. Exit conditions
/// additionally carry the protective-stop policy applied while the position
/// opened by the matching entry is alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoCondition {
    pub required: Vec<IndicatorSpec>,
    #[serde(default)]
    pub optional: Vec<IndicatorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<ValueConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<ValueConfig>,
    /// Turns the stop-loss distance into a ratcheting trailing stop.
    #[serde(default)]
    pub trailing_sl: bool,
}

impl AlgoCondition {
    pub fn new(required: Vec<IndicatorSpec>) -> Self {
        AlgoCondition {
            required,
            optional: Vec::new(),
            stop_loss: None,
            take_profit: None,
            trailing_sl: false,
        }
    }

    pub fn indicator_specs(&self) -> impl Iterator<Item = &IndicatorSpec> {
        self.required.iter().chain(self.optional.iter())
    }
}

/// Which directions the algo may trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgoType {
    Long,
    Short,
    Both,
}

impl AlgoType {
    pub fn allows_long(self) -> bool {
        matches!(self, AlgoType::Long | AlgoType::Both)
    }

    pub fn allows_short(self) -> bool {
        matches!(self, AlgoType::Short | AlgoType::Both)
    }
}

/// Post-trade timeout behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutMode {
    /// Leave to cash as soon as the cooldown has elapsed.
    CooldownOnly,
    /// After cooldown, an opposite-direction signal re-enters immediately;
    /// otherwise leave to cash once the same-direction signal has dropped.
    Regular,
    /// After cooldown, leave to cash only once both entry signals are false.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub mode: TimeoutMode,
    pub cooldown_bars: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            mode: TimeoutMode::CooldownOnly,
            cooldown_bars: 0,
        }
    }
}

/// Order types the executor port understands. The backtest only ever places
/// market orders; the other variants exist for the live executor surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    #[default]
    Market,
    Limit,
    Twap,
    Smart,
}

/// The full strategy definition consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoParams {
    #[serde(rename = "type")]
    pub algo_type: AlgoType,
    pub coin_symbol: String,
    pub starting_capital_usd: f64,
    pub position_size: ValueConfig,
    #[serde(default)]
    pub order_type: OrderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_entry: Option<AlgoCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_exit: Option<AlgoCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_entry: Option<AlgoCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_exit: Option<AlgoCondition>,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    /// Fire entries and indicator exits on condition level instead of the
    /// false-to-true edge.
    #[serde(default)]
    pub assume_position_immediately: bool,
}

impl AlgoParams {
    /// All indicator specs referenced by entry and exit conditions,
    /// in declaration order, duplicates included.
    pub fn condition_specs(&self) -> Vec<&IndicatorSpec> {
        [
            &self.long_entry,
            &self.long_exit,
            &self.short_entry,
            &self.short_exit,
        ]
        .into_iter()
        .flatten()
        .flat_map(|cond| cond.indicator_specs())
        .collect()
    }

    /// All DYN value configs (sizing + stops) that need a value factor.
    pub fn dyn_value_configs(&self) -> Vec<&ValueConfig> {
        let mut configs = vec![&self.position_size];
        for cond in [&self.long_exit, &self.short_exit].into_iter().flatten() {
            if let Some(sl) = &cond.stop_loss {
                configs.push(sl);
            }
            if let Some(tp) = &cond.take_profit {
                configs.push(tp);
            }
        }
        configs
            .into_iter()
            .filter(|cfg| cfg.value_type == ValueType::Dyn)
            .collect()
    }
}

/// Time range, trade cap, and end-of-run behaviour for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades_limit: Option<u32>,
    #[serde(default = "default_true")]
    pub close_position_on_exit: bool,
    #[serde(default = "default_capital_scaler")]
    pub capital_scaler: f64,
    /// Degrade DYN stop configs with an unusable value factor to REL instead
    /// of failing the run.
    #[serde(default)]
    pub degrade_dyn_to_rel: bool,
}

fn default_true() -> bool {
    true
}

fn default_capital_scaler() -> f64 {
    1.0
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            start_time: None,
            end_time: None,
            trades_limit: None,
            close_position_on_exit: true,
            capital_scaler: 1.0,
            degrade_dyn_to_rel: false,
        }
    }
}

/// Top-level backtest input: strategy + run settings + cost model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestInput {
    pub algo: AlgoParams,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
}

fn default_fee_bps() -> f64 {
    10.0
}

fn default_slippage_bps() -> f64 {
    5.0
}

impl BacktestInput {
    /// Load a backtest definition from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents =
            fs::read_to_string(path.as_ref()).context("Failed to read backtest config file")?;
        let input: BacktestInput =
            serde_json::from_str(&contents).context("Failed to parse backtest config JSON")?;
        Ok(input)
    }

    /// Schema-level validation, run before any simulation work.
    pub fn validate(&self) -> Result<(), BacktestError> {
        let algo = &self.algo;
        if !(algo.starting_capital_usd > 0.0) {
            return Err(BacktestError::InvalidConfig(
                "starting_capital_usd must be positive".to_string(),
            ));
        }
        if !(self.run.capital_scaler > 0.0) {
            return Err(BacktestError::InvalidConfig(
                "capital_scaler must be positive".to_string(),
            ));
        }
        if algo.coin_symbol.is_empty() {
            return Err(BacktestError::InvalidConfig(
                "coin_symbol must not be empty".to_string(),
            ));
        }
        if self.fee_bps < 0.0 || self.slippage_bps < 0.0 {
            return Err(BacktestError::InvalidConfig(
                "fee_bps and slippage_bps must be non-negative".to_string(),
            ));
        }
        if !(algo.position_size.value > 0.0) {
            return Err(BacktestError::InvalidConfig(
                "position_size value must be positive".to_string(),
            ));
        }

        if algo.algo_type.allows_long() {
            Self::require_condition(&algo.long_entry, "long_entry")?;
            Self::require_condition(&algo.long_exit, "long_exit")?;
        }
        if algo.algo_type.allows_short() {
            Self::require_condition(&algo.short_entry, "short_entry")?;
            Self::require_condition(&algo.short_exit, "short_exit")?;
        }

        for cfg in algo.dyn_value_configs() {
            if cfg.value_factor.is_none() {
                return Err(BacktestError::InvalidConfig(
                    "DYN value config requires a value_factor indicator".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn require_condition(
        cond: &Option<AlgoCondition>,
        name: &str,
    ) -> Result<(), BacktestError> {
        match cond {
            None => Err(BacktestError::InvalidConfig(format!(
                "{} is required for the configured algo type",
                name
            ))),
            Some(c) if c.required.is_empty() => Err(BacktestError::InvalidConfig(format!(
                "{} must name at least one required indicator",
                name
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsi_spec() -> IndicatorSpec {
        IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M5)
            .with_param("period", 14.0)
            .with_param("threshold", 30.0)
            .with_param("below", 1.0)
    }

    fn minimal_input() -> BacktestInput {
        BacktestInput {
            algo: AlgoParams {
                algo_type: AlgoType::Long,
                coin_symbol: "BTC".to_string(),
                starting_capital_usd: 10_000.0,
                position_size: ValueConfig::rel(0.1),
                order_type: OrderKind::Market,
                long_entry: Some(AlgoCondition::new(vec![rsi_spec()])),
                long_exit: Some(AlgoCondition::new(vec![IndicatorSpec::new(
                    IndicatorKind::EmaCross,
                    Timeframe::M5,
                )
                .with_param("fast", 9.0)
                .with_param("slow", 21.0)])),
                short_entry: None,
                short_exit: None,
                timeout: TimeoutConfig::default(),
                assume_position_immediately: false,
            },
            run: RunSettings::default(),
            fee_bps: 10.0,
            slippage_bps: 5.0,
        }
    }

    #[test]
    fn test_cache_key_is_stable_and_param_ordered() {
        let a = IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M5)
            .with_param("threshold", 30.0)
            .with_param("period", 14.0);
        let b = IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M5)
            .with_param("period", 14.0)
            .with_param("threshold", 30.0);
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("rsi@5m"));
    }

    #[test]
    fn test_cache_key_distinguishes_params() {
        let a = rsi_spec();
        let mut b = rsi_spec();
        b.params.insert("period".to_string(), 21.0);
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_validate_accepts_minimal_long_algo() {
        assert!(minimal_input().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capital() {
        let mut input = minimal_input();
        input.algo.starting_capital_usd = 0.0;
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_conditions() {
        let mut input = minimal_input();
        input.algo.long_exit = None;
        assert!(input.validate().is_err());

        let mut input = minimal_input();
        input.algo.algo_type = AlgoType::Both;
        assert!(input.validate().is_err(), "BOTH needs short conditions too");
    }

    #[test]
    fn test_validate_rejects_dyn_without_factor() {
        let mut input = minimal_input();
        input.algo.position_size = ValueConfig {
            value_type: ValueType::Dyn,
            value: 0.2,
            value_factor: None,
            inverted: false,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_input_json_roundtrip() {
        let input = minimal_input();
        let json = serde_json::to_string(&input).unwrap();
        let back: BacktestInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.algo.coin_symbol, "BTC");
        assert_eq!(back.fee_bps, 10.0);
        assert!(back.run.close_position_on_exit);
    }
}
