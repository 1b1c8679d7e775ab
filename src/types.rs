//! Core data types used across the backtesting engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BacktestError;

/// OHLCV candlestick for a fixed time bucket.
///
/// `bucket` is the bar's opening time in epoch seconds. Buckets within a
/// series are strictly ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a candle, validating the OHLC relation and finiteness.
    pub fn new(
        bucket: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BacktestError> {
        let candle = Candle {
            bucket,
            open,
            high,
            low,
            close,
            volume,
        };
        candle
            .check()
            .map_err(|reason| BacktestError::InvalidCandleData { index: 0, reason })?;
        Ok(candle)
    }

    /// Create a candle without validation (test fixtures, synthesized bars).
    pub fn new_unchecked(
        bucket: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Candle {
            bucket,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate this candle in isolation.
    pub fn check(&self) -> Result<(), String> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err("non-finite field".to_string());
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(format!(
                "OHLC relation violated: o={} h={} l={} c={}",
                self.open, self.high, self.low, self.close
            ));
        }
        if self.volume < 0.0 {
            return Err(format!("negative volume: {}", self.volume));
        }
        Ok(())
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.bucket, 0).unwrap_or_else(Utc::now)
    }

    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Candle timeframes the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1800,
            Timeframe::H1 => 3600,
            Timeframe::H4 => 14400,
            Timeframe::D1 => 86400,
        }
    }

    pub fn from_secs(secs: i64) -> Option<Self> {
        match secs {
            60 => Some(Timeframe::M1),
            300 => Some(Timeframe::M5),
            900 => Some(Timeframe::M15),
            1800 => Some(Timeframe::M30),
            3600 => Some(Timeframe::H1),
            14400 => Some(Timeframe::H4),
            86400 => Some(Timeframe::D1),
            _ => None,
        }
    }

    /// The next-lower timeframe used for intrabar expansion, if any.
    pub fn sub_timeframe(self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => None,
            Timeframe::M5 => Some(Timeframe::M1),
            Timeframe::M15 => Some(Timeframe::M5),
            Timeframe::M30 => Some(Timeframe::M15),
            Timeframe::H1 => Some(Timeframe::M15),
            Timeframe::H4 => Some(Timeframe::H1),
            Timeframe::D1 => Some(Timeframe::H4),
        }
    }

    /// Number of sub-bars one parent bar expands into.
    pub fn sub_bar_count(self) -> usize {
        match self.sub_timeframe() {
            Some(sub) => (self.secs() / sub.secs()) as usize,
            None => 0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {}", other)),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Direction of an open trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn opposite(self) -> TradeDirection {
        match self {
            TradeDirection::Long => TradeDirection::Short,
            TradeDirection::Short => TradeDirection::Long,
        }
    }
}

/// Position state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Cash,
    Long,
    Short,
    Timeout,
}

/// Why the machine is parked in TIMEOUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutReason {
    PostTrade,
    Ambiguity,
}

/// Context carried while the machine is in TIMEOUT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutContext {
    pub reason: TimeoutReason,
    pub previous_direction: Option<TradeDirection>,
    pub bars_in_timeout: u32,
}

/// Why a state transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionReason {
    /// Entry condition edge (or level when positions are assumed immediately).
    EntrySignal,
    /// Entry taken while leaving a post-trade cooldown.
    CooldownEntry,
    /// Indicator exit condition fired.
    ExitSignal,
    StopLoss,
    TakeProfit,
    TrailingStop,
    /// Both entry directions fired on the same bar.
    Ambiguity,
    /// Cooldown elapsed with no entry, back to cash.
    CooldownElapsed,
    /// Open position force-closed at the final candle.
    EndOfBacktest,
}

impl TransitionReason {
    /// True for reasons that close an open position.
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            TransitionReason::ExitSignal
                | TransitionReason::StopLoss
                | TransitionReason::TakeProfit
                | TransitionReason::TrailingStop
                | TransitionReason::EndOfBacktest
        )
    }
}

/// A single asset swap executed by the executor.
///
/// One swap is written per fill. `from_amount`, `to_amount`, and `price`
/// agree within fee/slippage tolerance; ids are unique and monotonic within
/// a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapEvent {
    pub id: u64,
    pub timestamp: i64,
    pub bar_index: usize,
    pub from_asset: String,
    pub to_asset: String,
    pub from_amount: f64,
    pub to_amount: f64,
    pub price: f64,
    pub fee_usd: f64,
    pub slippage_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_entry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_direction: Option<TradeDirection>,
}

/// A closed trade derived from a paired entry + exit swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub id: u64,
    pub direction: TradeDirection,
    pub entry_swap_id: u64,
    pub exit_swap_id: u64,
    pub entry_bar: usize,
    pub exit_bar: usize,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usd: f64,
    /// Swap-based profit: exit proceeds minus entry notional (mirrored for
    /// SHORT). Slippage is embedded in the fill prices; fees are not
    /// deducted here.
    pub pnl_usd: f64,
    /// `pnl_usd` minus the fees of both legs.
    pub net_pnl_usd: f64,
    pub fees_usd: f64,
    pub slippage_usd: f64,
    pub duration_secs: i64,
}

/// Snapshot of one compound condition at a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSnapshot {
    pub required_true: usize,
    pub required_total: usize,
    pub optional_true: usize,
    pub optional_total: usize,
    pub condition_met: bool,
    /// How many more signals would have to flip for the condition to fire.
    /// The "at least one optional" clause counts as one missing signal, but
    /// only when optional indicators are configured at all.
    pub distance_from_trigger: usize,
}

/// The four compound conditions an algo can define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    LongEntry,
    LongExit,
    ShortEntry,
    ShortExit,
}

impl ConditionType {
    pub fn all() -> [ConditionType; 4] {
        [
            ConditionType::LongEntry,
            ConditionType::LongExit,
            ConditionType::ShortEntry,
            ConditionType::ShortExit,
        ]
    }
}

/// Discriminant of an [`AlgoEvent`], used for filtering and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgoEventType {
    IndicatorFlip,
    ConditionChange,
    StateTransition,
    SlSet,
    TpSet,
    TrailingUpdate,
    SlHit,
    TpHit,
    TrailingHit,
}

/// Everything the engine records about a run, as a tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgoEvent {
    IndicatorFlip {
        timestamp: i64,
        bar_index: usize,
        cache_key: String,
        condition: ConditionType,
        previous: bool,
        current: bool,
        snapshot: ConditionSnapshot,
    },
    ConditionChange {
        timestamp: i64,
        bar_index: usize,
        condition: ConditionType,
        previous_met: bool,
        new_met: bool,
        /// The last indicator of this condition that flipped on this bar.
        #[serde(skip_serializing_if = "Option::is_none")]
        triggered_by: Option<String>,
        snapshot: ConditionSnapshot,
    },
    StateTransition {
        timestamp: i64,
        bar_index: usize,
        from: PositionState,
        to: PositionState,
        reason: TransitionReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<TradeDirection>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<TimeoutContext>,
    },
    SlSet {
        timestamp: i64,
        bar_index: usize,
        level: f64,
    },
    TpSet {
        timestamp: i64,
        bar_index: usize,
        level: f64,
    },
    TrailingUpdate {
        timestamp: i64,
        bar_index: usize,
        level: f64,
    },
    SlHit {
        timestamp: i64,
        bar_index: usize,
        level: f64,
        trigger_price: f64,
    },
    TpHit {
        timestamp: i64,
        bar_index: usize,
        level: f64,
        trigger_price: f64,
    },
    TrailingHit {
        timestamp: i64,
        bar_index: usize,
        level: f64,
        trigger_price: f64,
    },
}

impl AlgoEvent {
    pub fn timestamp(&self) -> i64 {
        match self {
            AlgoEvent::IndicatorFlip { timestamp, .. }
            | AlgoEvent::ConditionChange { timestamp, .. }
            | AlgoEvent::StateTransition { timestamp, .. }
            | AlgoEvent::SlSet { timestamp, .. }
            | AlgoEvent::TpSet { timestamp, .. }
            | AlgoEvent::TrailingUpdate { timestamp, .. }
            | AlgoEvent::SlHit { timestamp, .. }
            | AlgoEvent::TpHit { timestamp, .. }
            | AlgoEvent::TrailingHit { timestamp, .. } => *timestamp,
        }
    }

    pub fn bar_index(&self) -> usize {
        match self {
            AlgoEvent::IndicatorFlip { bar_index, .. }
            | AlgoEvent::ConditionChange { bar_index, .. }
            | AlgoEvent::StateTransition { bar_index, .. }
            | AlgoEvent::SlSet { bar_index, .. }
            | AlgoEvent::TpSet { bar_index, .. }
            | AlgoEvent::TrailingUpdate { bar_index, .. }
            | AlgoEvent::SlHit { bar_index, .. }
            | AlgoEvent::TpHit { bar_index, .. }
            | AlgoEvent::TrailingHit { bar_index, .. } => *bar_index,
        }
    }

    pub fn event_type(&self) -> AlgoEventType {
        match self {
            AlgoEvent::IndicatorFlip { .. } => AlgoEventType::IndicatorFlip,
            AlgoEvent::ConditionChange { .. } => AlgoEventType::ConditionChange,
            AlgoEvent::StateTransition { .. } => AlgoEventType::StateTransition,
            AlgoEvent::SlSet { .. } => AlgoEventType::SlSet,
            AlgoEvent::TpSet { .. } => AlgoEventType::TpSet,
            AlgoEvent::TrailingUpdate { .. } => AlgoEventType::TrailingUpdate,
            AlgoEvent::SlHit { .. } => AlgoEventType::SlHit,
            AlgoEvent::TpHit { .. } => AlgoEventType::TpHit,
            AlgoEvent::TrailingHit { .. } => AlgoEventType::TrailingHit,
        }
    }
}

/// One point of the mark-to-market equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub bar_index: usize,
    pub equity: f64,
    /// `(peak - equity) / peak` over the curve so far; never negative.
    pub drawdown_pct: f64,
}
