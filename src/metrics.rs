//! Performance and diagnostic metrics
//!
//! Swap metrics summarize the trade ledger and equity curve (win rate,
//! profit factor, drawdown, risk ratios on daily returns). Algo metrics
//! turn the event log into per-indicator and per-condition diagnostics:
//! flip behaviour, time-in-state, near-miss analysis, exit reasons.

use itertools::Itertools;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::HashMap;

use crate::types::{
    AlgoEvent, AlgoEventType, ConditionType, EquityPoint, PositionState, SwapEvent, TradeDirection,
    TradeEvent, TransitionReason,
};

const SECONDS_PER_DAY: i64 = 86_400;
/// Crypto markets trade every day of the year; daily risk ratios annualize
/// with sqrt(365). The same factor is used for Sharpe and Sortino.
const ANNUALIZATION_DAYS: f64 = 365.0;

/// Per-direction trade breakdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectionMetrics {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub total_pnl: f64,
}

impl DirectionMetrics {
    fn from_trades<'a>(trades: impl Iterator<Item = &'a TradeEvent>) -> Self {
        let mut out = DirectionMetrics::default();
        for trade in trades {
            out.trades += 1;
            out.total_pnl += trade.pnl_usd;
            if trade.pnl_usd > 0.0 {
                out.wins += 1;
                out.gross_profit += trade.pnl_usd;
            } else if trade.pnl_usd < 0.0 {
                out.losses += 1;
                out.gross_loss += trade.pnl_usd.abs();
            }
        }
        if out.trades > 0 {
            out.win_rate = out.wins as f64 / out.trades as f64;
        }
        out
    }
}

/// Aggregate performance of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub long: DirectionMetrics,
    pub short: DirectionMetrics,
    pub avg_duration_secs: f64,
    pub avg_win_duration_secs: f64,
    pub avg_loss_duration_secs: f64,
    pub total_fees_usd: f64,
    pub total_slippage_usd: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_usd: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
}

/// Compute swap metrics from the trade ledger, swap history, and equity
/// curve.
pub fn compute_swap_metrics(
    trades: &[TradeEvent],
    swaps: &[SwapEvent],
    equity: &[EquityPoint],
) -> SwapMetrics {
    let mut metrics = SwapMetrics {
        total_trades: trades.len(),
        ..Default::default()
    };

    let winners: Vec<&TradeEvent> = trades.iter().filter(|t| t.pnl_usd > 0.0).collect();
    let losers: Vec<&TradeEvent> = trades.iter().filter(|t| t.pnl_usd < 0.0).collect();

    metrics.winning_trades = winners.len();
    metrics.losing_trades = losers.len();
    if !trades.is_empty() {
        metrics.win_rate = winners.len() as f64 / trades.len() as f64;
        metrics.avg_duration_secs =
            trades.iter().map(|t| t.duration_secs as f64).sum::<f64>() / trades.len() as f64;
    }

    metrics.gross_profit = winners.iter().map(|t| t.pnl_usd).sum();
    metrics.gross_loss = losers.iter().map(|t| t.pnl_usd.abs()).sum();
    metrics.profit_factor = if metrics.gross_loss > 0.0 {
        metrics.gross_profit / metrics.gross_loss
    } else if metrics.gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    if !winners.is_empty() {
        metrics.avg_win = metrics.gross_profit / winners.len() as f64;
        metrics.avg_win_duration_secs =
            winners.iter().map(|t| t.duration_secs as f64).sum::<f64>() / winners.len() as f64;
    }
    if !losers.is_empty() {
        metrics.avg_loss = metrics.gross_loss / losers.len() as f64;
        metrics.avg_loss_duration_secs =
            losers.iter().map(|t| t.duration_secs as f64).sum::<f64>() / losers.len() as f64;
    }
    metrics.largest_win = winners.iter().map(|t| t.pnl_usd).fold(0.0, f64::max);
    metrics.largest_loss = losers.iter().map(|t| t.pnl_usd).fold(0.0, f64::min);

    metrics.long = DirectionMetrics::from_trades(
        trades.iter().filter(|t| t.direction == TradeDirection::Long),
    );
    metrics.short = DirectionMetrics::from_trades(
        trades
            .iter()
            .filter(|t| t.direction == TradeDirection::Short),
    );

    metrics.total_fees_usd = swaps.iter().map(|s| s.fee_usd).sum();
    metrics.total_slippage_usd = swaps.iter().map(|s| s.slippage_usd).sum();

    if let (Some(first), Some(last)) = (equity.first(), equity.last()) {
        if first.equity > 0.0 {
            metrics.total_return_pct = (last.equity - first.equity) / first.equity * 100.0;
        }
    }

    let mut peak = f64::MIN;
    for point in equity {
        if point.equity > peak {
            peak = point.equity;
        }
        metrics.max_drawdown_pct = metrics.max_drawdown_pct.max(point.drawdown_pct);
        metrics.max_drawdown_usd = metrics.max_drawdown_usd.max(peak - point.equity);
    }

    let returns = daily_returns(equity);
    metrics.sharpe_ratio = sharpe(&returns);
    metrics.sortino_ratio = sortino(&returns);
    metrics.calmar_ratio = calmar(equity, metrics.max_drawdown_pct);

    metrics
}

/// Daily equity returns: the last equity of each 86400-second bucket
/// (counted from the first equity point), differenced.
fn daily_returns(equity: &[EquityPoint]) -> Vec<f64> {
    let first_ts = match equity.first() {
        Some(point) => point.timestamp,
        None => return Vec::new(),
    };

    let mut closes: Vec<(i64, f64)> = Vec::new();
    for point in equity {
        let day = (point.timestamp - first_ts) / SECONDS_PER_DAY;
        match closes.last_mut() {
            Some((last_day, value)) if *last_day == day => *value = point.equity,
            _ => closes.push((day, point.equity)),
        }
    }

    closes
        .iter()
        .tuple_windows()
        .filter(|((_, prev), _)| *prev > 0.0)
        .map(|((_, prev), (_, next))| (next - prev) / prev)
        .collect()
}

fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = Statistics::mean(returns);
    let std_dev = Statistics::std_dev(returns);
    if std_dev > 0.0 {
        mean / std_dev * ANNUALIZATION_DAYS.sqrt()
    } else {
        0.0
    }
}

fn sortino(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return f64::INFINITY;
    }
    let downside_dev =
        (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
    if downside_dev > 0.0 {
        Statistics::mean(returns) / downside_dev * ANNUALIZATION_DAYS.sqrt()
    } else {
        0.0
    }
}

fn calmar(equity: &[EquityPoint], max_drawdown_pct: f64) -> f64 {
    let (first, last) = match (equity.first(), equity.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return 0.0,
    };
    if first.equity <= 0.0 {
        return 0.0;
    }
    let total_return = (last.equity - first.equity) / first.equity;
    if max_drawdown_pct <= 0.0 {
        return if total_return > 0.0 { f64::INFINITY } else { 0.0 };
    }

    let duration_days = (last.timestamp - first.timestamp) as f64 / SECONDS_PER_DAY as f64;
    if duration_days <= 0.0 {
        return 0.0;
    }
    let annualized = (1.0 + total_return).powf(ANNUALIZATION_DAYS / duration_days) - 1.0;
    annualized / max_drawdown_pct
}

/// Flip behaviour and usefulness of one indicator.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorStats {
    pub cache_key: String,
    pub condition: ConditionType,
    pub flip_count: usize,
    pub avg_bars_true: f64,
    pub avg_bars_false: f64,
    pub pct_time_true: f64,
    /// Flips of this indicator that tipped a condition into firing.
    pub triggering_flips: usize,
    /// Bars where this indicator alone held its condition back.
    pub blocking_count: u64,
    /// Composite score in [0, 100].
    pub usefulness: f64,
}

/// Near-miss behaviour of one condition.
#[derive(Debug, Clone, Serialize)]
pub struct NearMissStats {
    pub condition: ConditionType,
    /// `distance_histogram[d]` = bars spent at distance `d` from firing.
    pub distance_histogram: Vec<u64>,
    /// Smallest non-zero distance ever observed.
    pub closest_without_trigger: Option<usize>,
    /// Times the condition got within one signal and backed off without
    /// firing.
    pub approach_sequences: u64,
    pub trigger_count: u64,
}

/// Diagnostic metrics derived from the event log and per-bar observations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlgoMetrics {
    pub indicators: Vec<IndicatorStats>,
    pub near_miss: Vec<NearMissStats>,
    pub state_distribution: HashMap<PositionState, u64>,
    pub exit_reasons: HashMap<TransitionReason, u64>,
    pub condition_triggers: HashMap<ConditionType, u64>,
    pub event_counts: HashMap<AlgoEventType, u64>,
}

/// Per-bar observations the collector gathered during the run.
pub struct AlgoMetricsInput<'a> {
    pub events: &'a [AlgoEvent],
    pub total_bars: usize,
    pub tracked: &'a [(String, ConditionType)],
    pub final_signals: &'a HashMap<String, bool>,
    pub distances: &'a HashMap<ConditionType, Vec<usize>>,
    pub blocking: &'a HashMap<String, u64>,
    pub state_bars: &'a HashMap<PositionState, u64>,
}

pub fn compute_algo_metrics(input: &AlgoMetricsInput<'_>) -> AlgoMetrics {
    let mut metrics = AlgoMetrics {
        state_distribution: input.state_bars.clone(),
        ..Default::default()
    };

    for event in input.events {
        *metrics.event_counts.entry(event.event_type()).or_default() += 1;
        match event {
            AlgoEvent::StateTransition { reason, .. } if reason.is_exit() => {
                *metrics.exit_reasons.entry(*reason).or_default() += 1;
            }
            AlgoEvent::ConditionChange {
                condition, new_met, ..
            } if *new_met => {
                *metrics.condition_triggers.entry(*condition).or_default() += 1;
            }
            _ => {}
        }
    }

    let indicators: Vec<IndicatorStats> = input
        .tracked
        .iter()
        .map(|(key, condition)| indicator_stats(key, *condition, input))
        .collect();
    metrics.indicators = indicators;

    for (condition, distances) in input.distances {
        metrics.near_miss.push(near_miss_stats(
            *condition,
            distances,
            metrics
                .condition_triggers
                .get(condition)
                .copied()
                .unwrap_or(0),
        ));
    }
    metrics
        .near_miss
        .sort_by_key(|n| format!("{:?}", n.condition));

    metrics
}

fn indicator_stats(
    key: &str,
    condition: ConditionType,
    input: &AlgoMetricsInput<'_>,
) -> IndicatorStats {
    // flips of this indicator, in bar order
    let flips: Vec<(usize, bool, bool)> = input
        .events
        .iter()
        .filter_map(|e| match e {
            AlgoEvent::IndicatorFlip {
                bar_index,
                cache_key,
                previous,
                current,
                ..
            } if cache_key == key => Some((*bar_index, *previous, *current)),
            _ => None,
        })
        .collect();

    let total_bars = input.total_bars;
    let mut true_bars = 0usize;
    let mut false_bars = 0usize;
    let mut true_intervals = 0usize;
    let mut false_intervals = 0usize;

    let mut account = |value: bool, len: usize| {
        if len == 0 {
            return;
        }
        if value {
            true_bars += len;
            true_intervals += 1;
        } else {
            false_bars += len;
            false_intervals += 1;
        }
    };

    if flips.is_empty() {
        // an indicator that never flips holds its value for the whole run
        let value = input.final_signals.get(key).copied().unwrap_or(false);
        account(value, total_bars);
    } else {
        // leading interval carries the previous value of the first flip, so
        // an indicator that starts true is credited for [0, first_flip)
        account(flips[0].1, flips[0].0);
        for window in flips.windows(2) {
            account(window[0].2, window[1].0 - window[0].0);
        }
        let (last_bar, _, last_value) = *flips.last().expect("non-empty flips");
        account(last_value, total_bars.saturating_sub(last_bar));
    }

    let pct_time_true = if total_bars > 0 {
        true_bars as f64 / total_bars as f64
    } else {
        0.0
    };

    let triggering_flips = input
        .events
        .iter()
        .filter(|e| {
            matches!(
                e,
                AlgoEvent::ConditionChange {
                    new_met: true,
                    triggered_by: Some(trigger),
                    ..
                } if trigger == key
            )
        })
        .count();
    let blocking_count = input.blocking.get(key).copied().unwrap_or(0);
    let flip_count = flips.len();

    // composite usefulness: does it trigger entries, is it balanced, does it
    // actually move
    let trigger_part = if flip_count > 0 {
        triggering_flips as f64 / flip_count as f64
    } else {
        0.0
    };
    let balance_part = 1.0 - (pct_time_true - 0.5).abs() * 2.0;
    let activity_part = if total_bars > 0 {
        (flip_count as f64 * 100.0 / total_bars as f64).min(1.0)
    } else {
        0.0
    };
    let usefulness =
        ((0.5 * trigger_part + 0.3 * balance_part + 0.2 * activity_part) * 100.0).clamp(0.0, 100.0);

    IndicatorStats {
        cache_key: key.to_string(),
        condition,
        flip_count,
        avg_bars_true: if true_intervals > 0 {
            true_bars as f64 / true_intervals as f64
        } else {
            0.0
        },
        avg_bars_false: if false_intervals > 0 {
            false_bars as f64 / false_intervals as f64
        } else {
            0.0
        },
        pct_time_true,
        triggering_flips,
        blocking_count,
        usefulness,
    }
}

fn near_miss_stats(
    condition: ConditionType,
    distances: &[usize],
    trigger_count: u64,
) -> NearMissStats {
    let max_distance = distances.iter().copied().max().unwrap_or(0);
    let mut histogram = vec![0u64; max_distance + 1];
    for &d in distances {
        histogram[d] += 1;
    }

    let closest_without_trigger = distances.iter().copied().filter(|&d| d > 0).min();

    // a run that descends to distance 1 and backs off without reaching 0
    let mut approach_sequences = 0u64;
    let mut pending = false;
    let mut prev = usize::MAX;
    for &d in distances {
        if d == 0 {
            pending = false;
        } else if d == 1 && prev > 1 {
            pending = true;
        } else if d > 1 && pending {
            approach_sequences += 1;
            pending = false;
        }
        prev = d;
    }
    if pending {
        approach_sequences += 1;
    }

    NearMissStats {
        condition,
        distance_histogram: histogram,
        closest_without_trigger,
        approach_sequences,
        trigger_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::types::ConditionSnapshot;

    fn trade(direction: TradeDirection, pnl: f64, duration: i64) -> TradeEvent {
        TradeEvent {
            id: 1,
            direction,
            entry_swap_id: 1,
            exit_swap_id: 2,
            entry_bar: 0,
            exit_bar: 1,
            entry_time: 0,
            exit_time: duration,
            entry_price: 100.0,
            exit_price: 100.0,
            size_usd: 1000.0,
            pnl_usd: pnl,
            net_pnl_usd: pnl,
            fees_usd: 0.0,
            slippage_usd: 0.0,
            duration_secs: duration,
        }
    }

    fn equity_point(day: i64, equity: f64, drawdown_pct: f64) -> EquityPoint {
        EquityPoint {
            timestamp: day * SECONDS_PER_DAY,
            bar_index: day as usize,
            equity,
            drawdown_pct,
        }
    }

    fn flip(bar: usize, key: &str, previous: bool, current: bool) -> AlgoEvent {
        AlgoEvent::IndicatorFlip {
            timestamp: bar as i64 * 60,
            bar_index: bar,
            cache_key: key.to_string(),
            condition: ConditionType::LongEntry,
            previous,
            current,
            snapshot: ConditionSnapshot {
                required_true: 0,
                required_total: 1,
                optional_true: 0,
                optional_total: 0,
                condition_met: false,
                distance_from_trigger: 1,
            },
        }
    }

    #[test]
    fn test_profit_factor_boundaries() {
        // all winners: infinity
        let winners = vec![trade(TradeDirection::Long, 10.0, 60)];
        let m = compute_swap_metrics(&winners, &[], &[]);
        assert!(m.profit_factor.is_infinite());

        // no trades at all: zero
        let m = compute_swap_metrics(&[], &[], &[]);
        assert_eq!(m.profit_factor, 0.0);

        // mixed
        let mixed = vec![
            trade(TradeDirection::Long, 30.0, 60),
            trade(TradeDirection::Long, -10.0, 60),
        ];
        let m = compute_swap_metrics(&mixed, &[], &[]);
        assert_relative_eq!(m.profit_factor, 3.0);
        assert_eq!(m.winning_trades, 1);
        assert_eq!(m.losing_trades, 1);
        assert_relative_eq!(m.win_rate, 0.5);
    }

    #[test]
    fn test_zero_pnl_trade_is_not_a_win() {
        let trades = vec![trade(TradeDirection::Long, 0.0, 60)];
        let m = compute_swap_metrics(&trades, &[], &[]);
        assert_eq!(m.winning_trades, 0);
        assert_eq!(m.losing_trades, 0);
        assert_eq!(m.total_trades, 1);
    }

    #[test]
    fn test_direction_breakdown() {
        let trades = vec![
            trade(TradeDirection::Long, 10.0, 60),
            trade(TradeDirection::Short, -5.0, 120),
            trade(TradeDirection::Short, 15.0, 60),
        ];
        let m = compute_swap_metrics(&trades, &[], &[]);
        assert_eq!(m.long.trades, 1);
        assert_eq!(m.short.trades, 2);
        assert_eq!(m.short.wins, 1);
        assert_relative_eq!(m.short.total_pnl, 10.0);
    }

    #[test]
    fn test_max_drawdown_from_curve() {
        let equity = vec![
            equity_point(0, 1000.0, 0.0),
            equity_point(1, 1200.0, 0.0),
            equity_point(2, 900.0, 0.25),
            equity_point(3, 1100.0, 1.0 - 1100.0 / 1200.0),
        ];
        let m = compute_swap_metrics(&[], &[], &equity);
        assert_relative_eq!(m.max_drawdown_pct, 0.25);
        assert_relative_eq!(m.max_drawdown_usd, 300.0);
    }

    #[test]
    fn test_sharpe_needs_two_daily_samples() {
        let equity = vec![equity_point(0, 1000.0, 0.0), equity_point(0, 1001.0, 0.0)];
        let m = compute_swap_metrics(&[], &[], &equity);
        assert_eq!(m.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_sortino_infinite_without_downside() {
        let equity = vec![
            equity_point(0, 1000.0, 0.0),
            equity_point(1, 1010.0, 0.0),
            equity_point(2, 1025.0, 0.0),
            equity_point(3, 1030.0, 0.0),
        ];
        let m = compute_swap_metrics(&[], &[], &equity);
        assert!(m.sortino_ratio.is_infinite());
        assert!(m.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_calmar_infinite_without_drawdown() {
        let equity = vec![equity_point(0, 1000.0, 0.0), equity_point(10, 1100.0, 0.0)];
        let m = compute_swap_metrics(&[], &[], &equity);
        assert!(m.calmar_ratio.is_infinite());

        // flat run with no drawdown and no gain: zero
        let flat = vec![equity_point(0, 1000.0, 0.0), equity_point(10, 1000.0, 0.0)];
        let m = compute_swap_metrics(&[], &[], &flat);
        assert_eq!(m.calmar_ratio, 0.0);
    }

    #[test]
    fn test_pct_time_true_with_leading_true_interval() {
        // indicator starts true, flips false at bar 6, true again at bar 8,
        // run ends at bar 10: true over [0,6) and [8,10) = 8 of 10 bars
        let events = vec![flip(6, "k", true, false), flip(8, "k", false, true)];
        let tracked = vec![("k".to_string(), ConditionType::LongEntry)];
        let final_signals: HashMap<String, bool> = [("k".to_string(), true)].into();
        let distances = HashMap::new();
        let blocking = HashMap::new();
        let state_bars = HashMap::new();

        let metrics = compute_algo_metrics(&AlgoMetricsInput {
            events: &events,
            total_bars: 10,
            tracked: &tracked,
            final_signals: &final_signals,
            distances: &distances,
            blocking: &blocking,
            state_bars: &state_bars,
        });

        let stats = &metrics.indicators[0];
        assert_eq!(stats.flip_count, 2);
        assert_relative_eq!(stats.pct_time_true, 0.8);
        // true intervals: 6 bars + 2 bars over two intervals
        assert_relative_eq!(stats.avg_bars_true, 4.0);
        assert_relative_eq!(stats.avg_bars_false, 2.0);
    }

    #[test]
    fn test_pct_time_true_without_flips() {
        let tracked = vec![("k".to_string(), ConditionType::LongEntry)];
        let final_signals: HashMap<String, bool> = [("k".to_string(), true)].into();
        let distances = HashMap::new();
        let blocking = HashMap::new();
        let state_bars = HashMap::new();

        let metrics = compute_algo_metrics(&AlgoMetricsInput {
            events: &[],
            total_bars: 5,
            tracked: &tracked,
            final_signals: &final_signals,
            distances: &distances,
            blocking: &blocking,
            state_bars: &state_bars,
        });
        assert_relative_eq!(metrics.indicators[0].pct_time_true, 1.0);
    }

    #[test]
    fn test_near_miss_approaches() {
        // distances: approach to 1 twice without firing, one actual trigger
        let distances = vec![3, 2, 1, 2, 1, 0, 1, 2];
        let stats = near_miss_stats(ConditionType::LongEntry, &distances, 1);

        assert_eq!(stats.closest_without_trigger, Some(1));
        // first dip to 1 backed off without firing; the second dip reached 0
        // (a trigger); the trailing 1 came from the fired state, so it is a
        // retreat, not an approach
        assert_eq!(stats.approach_sequences, 1);
        assert_eq!(stats.distance_histogram[1], 3);
        assert_eq!(stats.distance_histogram[0], 1);
        assert_eq!(stats.trigger_count, 1);
    }
}
