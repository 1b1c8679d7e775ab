//! Port traits connecting the algorithm runner to its environment
//!
//! The runner only ever talks to an executor, an event log, an indicator
//! feed, and a sub-bar provider through these traits. The backtest
//! implementations resolve every call synchronously; the async shapes exist
//! so a live trading variant can plug in without touching the runner.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::BacktestError;
use crate::types::{
    AlgoEvent, AlgoEventType, Candle, ConditionSnapshot, ConditionType, PositionState, Side,
    SwapEvent, Timeframe, TimeoutContext, TradeDirection,
};

/// Order types the executor surface accepts. The simulated executor only
/// fills `Market`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Twap,
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Rejected,
    Pending,
}

/// An order as submitted through the executor port.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub amount_usd: Option<f64>,
    pub amount_asset: Option<f64>,
    /// For protective exits the runner pins the fill to the stop level;
    /// a resting order fills at its own price, without slippage.
    pub limit_price: Option<f64>,
    pub time_in_force: Option<String>,
    pub is_entry: Option<bool>,
    pub trade_direction: Option<TradeDirection>,
}

impl OrderRequest {
    pub fn market(
        client_order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        amount_usd: f64,
    ) -> Self {
        OrderRequest {
            client_order_id: client_order_id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            amount_usd: Some(amount_usd),
            amount_asset: None,
            limit_price: None,
            time_in_force: None,
            is_entry: None,
            trade_direction: None,
        }
    }
}

/// Execution report returned for every order.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: u64,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_amount: f64,
    pub avg_price: f64,
    pub total_value_usd: f64,
    pub fee_usd: f64,
    pub slippage_usd: f64,
    pub timestamp: i64,
    pub reject_reason: Option<String>,
}

/// An open position as reported by the executor.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub direction: TradeDirection,
    /// Asset-denominated size.
    pub size: f64,
    pub size_usd: f64,
    pub entry_price: f64,
    pub entry_time: i64,
}

/// Order execution and account state.
#[async_trait]
pub trait ExecutorPort: Send {
    async fn place_order(&mut self, req: OrderRequest) -> OrderResult;

    async fn get_position(&self, symbol: &str) -> Option<PositionInfo>;

    async fn get_current_price(&self, symbol: &str) -> f64;

    /// Mark-to-market account balance in USD.
    async fn get_balance(&self) -> f64;

    async fn cancel_order(&mut self, order_id: u64) -> bool;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Vec<OrderResult>;

    /// Simulation hook: position the executor on the current bar.
    fn set_current_bar(&mut self, bar_index: usize, timestamp: i64);

    /// Simulation hook: set the mark price used for fills and valuation.
    fn set_current_price(&mut self, price: f64);

    /// Take the swap events recorded since the last call, in fill order.
    /// The runner forwards them to the event log after every order.
    fn drain_swaps(&mut self) -> Vec<SwapEvent>;
}

/// Filter for event retrieval.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub start_bar: Option<usize>,
    pub end_bar: Option<usize>,
    pub limit: Option<usize>,
    pub event_types: Option<Vec<AlgoEventType>>,
}

impl EventFilter {
    pub fn matches(&self, timestamp: i64, bar_index: usize) -> bool {
        self.start_time.map_or(true, |t| timestamp >= t)
            && self.end_time.map_or(true, |t| timestamp <= t)
            && self.start_bar.map_or(true, |b| bar_index >= b)
            && self.end_bar.map_or(true, |b| bar_index <= b)
    }

    pub fn matches_type(&self, event_type: AlgoEventType) -> bool {
        self.event_types
            .as_ref()
            .map_or(true, |types| types.contains(&event_type))
    }
}

/// Machine state persisted between live runs. The backtest writes it once at
/// the end of a run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AlgoState {
    pub position_state: PositionState,
    pub timeout: Option<TimeoutContext>,
    pub current_trade_id: Option<u64>,
    pub trades_completed: u32,
    pub updated_at: i64,
}

/// Append-only sink for algo and swap events, with filtered retrieval.
#[async_trait]
pub trait EventLogPort: Send {
    async fn log_algo_event(&mut self, event: AlgoEvent) -> Result<(), BacktestError>;

    async fn log_swap_event(&mut self, swap: SwapEvent) -> Result<(), BacktestError>;

    async fn get_algo_events(&self, filter: &EventFilter) -> Result<Vec<AlgoEvent>, BacktestError>;

    async fn get_swap_events(&self, filter: &EventFilter)
        -> Result<Vec<SwapEvent>, BacktestError>;

    async fn save_state(&mut self, state: &AlgoState) -> Result<(), BacktestError>;

    async fn get_state(&self) -> Result<Option<AlgoState>, BacktestError>;
}

/// Read access to the pre-calculated, resampled indicator streams.
///
/// Purely in-memory in the backtest, hence synchronous; a live feed
/// pre-loads each bar before the runner touches it.
pub trait IndicatorFeedPort: Send {
    /// Advance to `bar_index`, snapshotting the previous bar's condition
    /// states for edge detection.
    fn set_current_bar(&mut self, bar_index: usize);

    fn get_current_signals(&self) -> HashMap<String, bool>;

    /// Unknown keys log once and read as false.
    fn get_signal(&self, cache_key: &str) -> bool;

    fn get_raw_value(&self, cache_key: &str) -> Option<f64>;

    fn evaluate_condition(&self, condition: ConditionType) -> bool;

    fn get_condition_snapshot(&self, condition: ConditionType) -> ConditionSnapshot;

    fn get_indicators_for_condition(&self, condition: ConditionType) -> Vec<String>;

    fn get_previous_condition_met(&self, condition: ConditionType) -> bool;

    fn get_total_bars(&self) -> usize;
}

/// Supplies the ordered sub-bars nested inside a parent bar.
#[async_trait]
pub trait SubBarProvider: Send + Sync {
    async fn get_sub_bar_candles(
        &self,
        symbol: &str,
        parent_ts: i64,
        parent_tf: Timeframe,
    ) -> Vec<Candle>;

    async fn get_sub_bar_candles_batch(
        &self,
        symbol: &str,
        parent_ts: &[i64],
        parent_tf: Timeframe,
    ) -> HashMap<i64, Vec<Candle>> {
        let mut out = HashMap::new();
        for &ts in parent_ts {
            out.insert(ts, self.get_sub_bar_candles(symbol, ts, parent_tf).await);
        }
        out
    }

    fn get_sub_bar_timeframe(&self, parent_tf: Timeframe) -> Option<Timeframe> {
        parent_tf.sub_timeframe()
    }

    fn get_sub_bar_count(&self, parent_tf: Timeframe) -> usize {
        parent_tf.sub_bar_count()
    }
}
