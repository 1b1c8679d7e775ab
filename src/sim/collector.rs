//! Event collector
//!
//! Watches the indicator feed bar by bar for indicator flips and condition
//! changes, tracks the per-bar data that the diagnostic metrics are built
//! from (distances, blocking signals, state residency), builds the equity
//! curve, and pairs swap events into closed trades.

use std::collections::HashMap;

use tracing::warn;

use crate::ports::IndicatorFeedPort;
use crate::types::{
    AlgoEvent, ConditionType, EquityPoint, PositionState, SwapEvent, TradeDirection, TradeEvent,
};

/// Registered indicator sets and the per-bar observations of one run.
#[derive(Debug, Default)]
pub struct EventCollector {
    /// Condition -> (required keys, optional keys), in registration order.
    registered: Vec<(ConditionType, Vec<String>, Vec<String>)>,
    /// Deduplicated keys with the first condition that owns each.
    tracked: Vec<(String, ConditionType)>,

    prev_signal: HashMap<String, bool>,
    prev_met: HashMap<ConditionType, bool>,
    primed: bool,

    equity: Vec<EquityPoint>,
    peak_equity: f64,

    state_bars: HashMap<PositionState, u64>,
    distances: HashMap<ConditionType, Vec<usize>>,
    blocking: HashMap<String, u64>,

    trade_seq: u64,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the indicator set of a condition. Call once per configured
    /// condition before the first bar.
    pub fn register_condition(
        &mut self,
        condition: ConditionType,
        required: Vec<String>,
        optional: Vec<String>,
    ) {
        for key in required.iter().chain(optional.iter()) {
            if !self.tracked.iter().any(|(k, _)| k == key) {
                self.tracked.push((key.clone(), condition));
            }
        }
        self.registered.push((condition, required, optional));
    }

    /// Clear all observations, keeping registrations.
    pub fn reset(&mut self) {
        self.prev_signal.clear();
        self.prev_met.clear();
        self.primed = false;
        self.equity.clear();
        self.peak_equity = 0.0;
        self.state_bars.clear();
        self.distances.clear();
        self.blocking.clear();
        self.trade_seq = 0;
    }

    /// Observe one bar of the feed, returning the flip and condition-change
    /// events it produced.
    pub fn observe_bar(
        &mut self,
        bar_index: usize,
        timestamp: i64,
        feed: &dyn IndicatorFeedPort,
    ) -> Vec<AlgoEvent> {
        let mut events = Vec::new();
        let mut flipped: HashMap<ConditionType, String> = HashMap::new();

        for (key, condition) in &self.tracked {
            let current = feed.get_signal(key);
            let previous = self.prev_signal.insert(key.clone(), current);
            if self.primed {
                let previous = previous.unwrap_or(false);
                if current != previous {
                    events.push(AlgoEvent::IndicatorFlip {
                        timestamp,
                        bar_index,
                        cache_key: key.clone(),
                        condition: *condition,
                        previous,
                        current,
                        snapshot: feed.get_condition_snapshot(*condition),
                    });
                    // remember the last flip per owning condition for
                    // trigger attribution
                    for (cond, required, optional) in &self.registered {
                        if required.contains(key) || optional.contains(key) {
                            flipped.insert(*cond, key.clone());
                        }
                    }
                }
            }
        }

        for (condition, required, _) in &self.registered {
            let snapshot = feed.get_condition_snapshot(*condition);
            let met = feed.evaluate_condition(*condition);
            let previous = self.prev_met.insert(*condition, met).unwrap_or(false);

            self.distances
                .entry(*condition)
                .or_default()
                .push(snapshot.distance_from_trigger);

            // one missing required signal blocks the whole condition
            if !met && snapshot.required_total > 0
                && snapshot.required_true == snapshot.required_total - 1
            {
                if let Some(blocker) = required.iter().find(|k| !feed.get_signal(k)) {
                    *self.blocking.entry(blocker.clone()).or_default() += 1;
                }
            }

            if self.primed && met != previous {
                events.push(AlgoEvent::ConditionChange {
                    timestamp,
                    bar_index,
                    condition: *condition,
                    previous_met: previous,
                    new_met: met,
                    triggered_by: flipped.get(condition).cloned(),
                    snapshot,
                });
            }
        }

        self.primed = true;
        events
    }

    /// Count the bar against the state the machine was in.
    pub fn record_state(&mut self, state: PositionState) {
        *self.state_bars.entry(state).or_default() += 1;
    }

    /// Append an equity observation and compute its drawdown.
    pub fn record_equity(&mut self, bar_index: usize, timestamp: i64, equity: f64) -> EquityPoint {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown_pct = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity
        } else {
            0.0
        };
        let point = EquityPoint {
            timestamp,
            bar_index,
            equity,
            drawdown_pct,
        };
        self.equity.push(point);
        point
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity
    }

    pub fn state_bars(&self) -> &HashMap<PositionState, u64> {
        &self.state_bars
    }

    pub fn distances(&self) -> &HashMap<ConditionType, Vec<usize>> {
        &self.distances
    }

    pub fn blocking_counts(&self) -> &HashMap<String, u64> {
        &self.blocking
    }

    /// Last observed signal value per tracked indicator. Together with the
    /// flip events this reconstructs the full true/false interval history.
    pub fn signal_states(&self) -> &HashMap<String, bool> {
        &self.prev_signal
    }

    /// Keys in registration order with the condition that owns each.
    pub fn tracked_keys(&self) -> &[(String, ConditionType)] {
        &self.tracked
    }

    /// Pair swaps into closed trades: a swap out of USD opens, the next swap
    /// into USD closes. The closing swap's source asset decides direction.
    pub fn pair_trades(&mut self, swaps: &[SwapEvent], symbol: &str) -> Vec<TradeEvent> {
        let mut trades = Vec::new();
        let mut pending: Option<&SwapEvent> = None;

        for swap in swaps {
            if swap.from_asset == "USD" {
                if pending.is_some() {
                    warn!(swap_id = swap.id, "entry swap while a trade is already open");
                }
                pending = Some(swap);
            } else if swap.to_asset == "USD" {
                let entry = match pending.take() {
                    Some(entry) => entry,
                    None => {
                        // exit without entry: log and move on, no trade forms
                        warn!(swap_id = swap.id, "exit swap without a pending entry");
                        continue;
                    }
                };

                let direction = if swap.from_asset == symbol {
                    TradeDirection::Long
                } else {
                    TradeDirection::Short
                };
                let pnl_usd = match direction {
                    TradeDirection::Long => swap.to_amount - entry.from_amount,
                    TradeDirection::Short => entry.from_amount - swap.to_amount,
                };
                let fees_usd = entry.fee_usd + swap.fee_usd;

                self.trade_seq += 1;
                trades.push(TradeEvent {
                    id: self.trade_seq,
                    direction,
                    entry_swap_id: entry.id,
                    exit_swap_id: swap.id,
                    entry_bar: entry.bar_index,
                    exit_bar: swap.bar_index,
                    entry_time: entry.timestamp,
                    exit_time: swap.timestamp,
                    entry_price: entry.price,
                    exit_price: swap.price,
                    size_usd: entry.from_amount,
                    pnl_usd,
                    net_pnl_usd: pnl_usd - fees_usd,
                    fees_usd,
                    slippage_usd: entry.slippage_usd + swap.slippage_usd,
                    duration_secs: swap.timestamp - entry.timestamp,
                });
            }
        }

        trades
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeDirection;

    fn swap(
        id: u64,
        bar: usize,
        from: &str,
        to: &str,
        from_amount: f64,
        to_amount: f64,
        price: f64,
    ) -> SwapEvent {
        SwapEvent {
            id,
            timestamp: bar as i64 * 60,
            bar_index: bar,
            from_asset: from.to_string(),
            to_asset: to.to_string(),
            from_amount,
            to_amount,
            price,
            fee_usd: 1.0,
            slippage_usd: 0.5,
            is_entry: None,
            trade_direction: None,
        }
    }

    #[test]
    fn test_pair_long_trade() {
        let mut collector = EventCollector::new();
        let swaps = vec![
            swap(1, 3, "USD", "BTC", 1000.0, 9.99, 100.05),
            swap(2, 7, "BTC", "USD", 9.99, 1098.0, 109.95),
        ];
        let trades = collector.pair_trades(&swaps, "BTC");

        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.direction, TradeDirection::Long);
        assert!((t.pnl_usd - 98.0).abs() < 1e-9);
        assert!((t.net_pnl_usd - 96.0).abs() < 1e-9);
        assert_eq!(t.entry_bar, 3);
        assert_eq!(t.exit_bar, 7);
        assert!(t.exit_bar >= t.entry_bar);
        assert!(t.exit_time >= t.entry_time);
    }

    #[test]
    fn test_pair_short_trade_mirrors_pnl() {
        let mut collector = EventCollector::new();
        let swaps = vec![
            swap(1, 2, "USD", "BTC-SHORT", 1000.0, 10.0, 99.95),
            swap(2, 5, "BTC-SHORT", "USD", 10.0, 900.0, 90.05),
        ];
        let trades = collector.pair_trades(&swaps, "BTC");

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].direction, TradeDirection::Short);
        assert!((trades[0].pnl_usd - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_without_entry_forms_no_trade() {
        let mut collector = EventCollector::new();
        let swaps = vec![swap(1, 2, "BTC", "USD", 5.0, 500.0, 100.0)];
        let trades = collector.pair_trades(&swaps, "BTC");
        assert!(trades.is_empty());
    }

    #[test]
    fn test_equity_drawdown_tracking() {
        let mut collector = EventCollector::new();
        collector.record_equity(0, 0, 1000.0);
        collector.record_equity(1, 60, 1100.0);
        let dipped = collector.record_equity(2, 120, 990.0);
        assert!((dipped.drawdown_pct - 0.1).abs() < 1e-9);

        let recovered = collector.record_equity(3, 180, 1100.0);
        assert_eq!(recovered.drawdown_pct, 0.0);

        // drawdown never negative, peak never forgotten
        for point in collector.equity_curve() {
            assert!(point.drawdown_pct >= 0.0);
        }
    }

    #[test]
    fn test_state_residency_counts() {
        let mut collector = EventCollector::new();
        collector.record_state(PositionState::Cash);
        collector.record_state(PositionState::Cash);
        collector.record_state(PositionState::Long);
        assert_eq!(collector.state_bars()[&PositionState::Cash], 2);
        assert_eq!(collector.state_bars()[&PositionState::Long], 1);
    }
}
