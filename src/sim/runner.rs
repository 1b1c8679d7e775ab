//! Environment-agnostic algorithm runner
//!
//! Drives one bar at a time: advances the feed, checks exits in priority
//! order (trailing stop, stop loss, take profit, indicator signal), checks
//! entries on condition edges, runs the timeout rules, and dispatches
//! orders and events through the executor and event-log ports. The runner
//! never touches capital directly; accounting lives behind the executor
//! port.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{AlgoParams, AlgoType, RunSettings, ValueConfig, ValueType};
use crate::error::BacktestError;
use crate::pipeline::subbar::ValueFactorSeries;
use crate::ports::{
    AlgoState, EventLogPort, ExecutorPort, IndicatorFeedPort, OrderRequest, OrderStatus,
};
use crate::sim::collector::EventCollector;
use crate::sim::feed::BacktestSignalFeed;
use crate::sim::special::{
    LevelPolicy, SpecialIndicator, SpecialIndicatorKind, StopLoss, TakeProfit, TrailingStop,
};
use crate::sim::state::{evaluate_timeout, StateMachine, TimeoutInputs, TimeoutVerdict};
use crate::types::{
    AlgoEvent, Candle, ConditionType, PositionState, Side, TradeDirection, TransitionReason,
};

pub struct AlgoRunner {
    params: AlgoParams,
    run: RunSettings,
    symbol: String,
    warmup_bars: usize,

    executor: Box<dyn ExecutorPort>,
    event_log: Box<dyn EventLogPort>,
    feed: BacktestSignalFeed,
    machine: StateMachine,
    collector: EventCollector,

    specials: Vec<Box<dyn SpecialIndicator>>,
    value_factors: HashMap<String, Arc<ValueFactorSeries>>,

    trades_completed: u32,
    order_seq: u64,
}

/// Everything a run leaves behind, handed back to the orchestrator.
pub struct RunArtifacts {
    pub event_log: Box<dyn EventLogPort>,
    pub executor: Box<dyn ExecutorPort>,
    pub collector: EventCollector,
    pub machine: StateMachine,
    pub trades_completed: u32,
}

impl AlgoRunner {
    pub fn new(
        params: AlgoParams,
        run: RunSettings,
        warmup_bars: usize,
        executor: Box<dyn ExecutorPort>,
        event_log: Box<dyn EventLogPort>,
        feed: BacktestSignalFeed,
        value_factors: HashMap<String, Arc<ValueFactorSeries>>,
    ) -> Self {
        let mut collector = EventCollector::new();
        let pairs = [
            (ConditionType::LongEntry, &params.long_entry),
            (ConditionType::LongExit, &params.long_exit),
            (ConditionType::ShortEntry, &params.short_entry),
            (ConditionType::ShortExit, &params.short_exit),
        ];
        for (condition, cond) in pairs {
            if let Some(cond) = cond {
                collector.register_condition(
                    condition,
                    cond.required.iter().map(|s| s.cache_key()).collect(),
                    cond.optional.iter().map(|s| s.cache_key()).collect(),
                );
            }
        }

        let symbol = params.coin_symbol.clone();
        AlgoRunner {
            params,
            run,
            symbol,
            warmup_bars,
            executor,
            event_log,
            feed,
            machine: StateMachine::new(),
            collector,
            specials: Vec::new(),
            value_factors,
            trades_completed: 0,
            order_seq: 0,
        }
    }

    /// Process one simulation bar. All event-log writes and state-machine
    /// transitions for this bar complete before the call returns.
    pub async fn process_bar(
        &mut self,
        bar_index: usize,
        candle: &Candle,
        sub_bars: &[Candle],
    ) -> Result<(), BacktestError> {
        self.feed.set_current_bar(bar_index);
        self.executor.set_current_bar(bar_index, candle.bucket);
        self.executor.set_current_price(candle.close);

        let observed = self.collector.observe_bar(bar_index, candle.bucket, &self.feed);
        for event in observed {
            self.event_log.log_algo_event(event).await?;
        }
        self.collector.record_state(self.machine.state());

        if bar_index < self.warmup_bars {
            self.record_equity(bar_index, candle).await;
            return Ok(());
        }

        match self.machine.state() {
            PositionState::Long => {
                self.check_exits(TradeDirection::Long, bar_index, candle, sub_bars)
                    .await?
            }
            PositionState::Short => {
                self.check_exits(TradeDirection::Short, bar_index, candle, sub_bars)
                    .await?
            }
            PositionState::Cash => self.check_entries(bar_index, candle).await?,
            PositionState::Timeout => self.handle_timeout(bar_index, candle).await?,
        }

        self.record_equity(bar_index, candle).await;
        Ok(())
    }

    /// Close any open position at the final candle and persist the machine
    /// state.
    pub async fn finish(
        &mut self,
        bar_index: usize,
        candle: &Candle,
    ) -> Result<(), BacktestError> {
        if self.run.close_position_on_exit {
            let direction = match self.machine.state() {
                PositionState::Long => Some(TradeDirection::Long),
                PositionState::Short => Some(TradeDirection::Short),
                _ => None,
            };
            if let Some(direction) = direction {
                self.exit_position(
                    direction,
                    bar_index,
                    candle,
                    TransitionReason::EndOfBacktest,
                    None,
                    None,
                )
                .await?;
            }
        }

        let open_trade = matches!(
            self.machine.state(),
            PositionState::Long | PositionState::Short
        );
        let state = AlgoState {
            position_state: self.machine.state(),
            timeout: self.machine.timeout_context(),
            current_trade_id: open_trade.then(|| u64::from(self.trades_completed) + 1),
            trades_completed: self.trades_completed,
            updated_at: candle.bucket,
        };
        self.event_log.save_state(&state).await?;
        Ok(())
    }

    pub fn into_artifacts(self) -> RunArtifacts {
        RunArtifacts {
            event_log: self.event_log,
            executor: self.executor,
            collector: self.collector,
            machine: self.machine,
            trades_completed: self.trades_completed,
        }
    }

    async fn record_equity(&mut self, bar_index: usize, candle: &Candle) {
        let balance = self.executor.get_balance().await;
        self.collector.record_equity(bar_index, candle.bucket, balance);
    }

    fn trades_limit_reached(&self) -> bool {
        self.run
            .trades_limit
            .map_or(false, |limit| self.trades_completed >= limit)
    }

    fn next_order_id(&mut self, tag: &str, bar_index: usize) -> String {
        self.order_seq += 1;
        format!("{}-{}-{}", tag, bar_index, self.order_seq)
    }

    /// The intrabar price path: sub-bar closes when available, otherwise the
    /// parent's open/high/low/close.
    fn price_path(candle: &Candle, sub_bars: &[Candle]) -> (Vec<f64>, Vec<i64>) {
        if sub_bars.is_empty() {
            (
                vec![candle.open, candle.high, candle.low, candle.close],
                vec![candle.bucket; 4],
            )
        } else {
            (
                sub_bars.iter().map(|c| c.close).collect(),
                sub_bars.iter().map(|c| c.bucket).collect(),
            )
        }
    }

    async fn check_exits(
        &mut self,
        direction: TradeDirection,
        bar_index: usize,
        candle: &Candle,
        sub_bars: &[Candle],
    ) -> Result<(), BacktestError> {
        let (prices, times) = Self::price_path(candle, sub_bars);
        for special in self.specials.iter_mut() {
            special.calculate(&prices, &times);
        }

        // highest-priority trigger wins, regardless of sub-bar order
        let triggered = self
            .specials
            .iter()
            .filter(|s| s.is_triggered())
            .min_by_key(|s| s.kind().priority())
            .map(|s| (s.kind(), s.get_level(), s.trigger_price()));

        if let Some((kind, level, trigger_price)) = triggered {
            let reason = match kind {
                SpecialIndicatorKind::TrailingStop => TransitionReason::TrailingStop,
                SpecialIndicatorKind::StopLoss => TransitionReason::StopLoss,
                SpecialIndicatorKind::TakeProfit => TransitionReason::TakeProfit,
            };
            return self
                .exit_position(direction, bar_index, candle, reason, Some(level), trigger_price)
                .await;
        }

        // surface level moves (trailing ratchet, DYN recompute)
        let moved: Vec<(SpecialIndicatorKind, f64)> = self
            .specials
            .iter()
            .filter(|s| s.level_moved())
            .map(|s| (s.kind(), s.get_level()))
            .collect();
        for (kind, level) in moved {
            self.log_level_event(kind, bar_index, candle.bucket, level)
                .await?;
        }

        let condition = match direction {
            TradeDirection::Long => ConditionType::LongExit,
            TradeDirection::Short => ConditionType::ShortExit,
        };
        let met = self.feed.evaluate_condition(condition);
        let fires = if self.params.assume_position_immediately {
            met
        } else {
            met && !self.feed.get_previous_condition_met(condition)
        };
        if fires {
            return self
                .exit_position(
                    direction,
                    bar_index,
                    candle,
                    TransitionReason::ExitSignal,
                    None,
                    None,
                )
                .await;
        }

        Ok(())
    }

    async fn check_entries(
        &mut self,
        bar_index: usize,
        candle: &Candle,
    ) -> Result<(), BacktestError> {
        let algo_type = self.params.algo_type;
        let long_met =
            algo_type.allows_long() && self.feed.evaluate_condition(ConditionType::LongEntry);
        let short_met =
            algo_type.allows_short() && self.feed.evaluate_condition(ConditionType::ShortEntry);

        // contradictory signals park the machine instead of picking a side
        if long_met && short_met && algo_type == AlgoType::Both {
            let record = self.machine.transition(
                PositionState::Timeout,
                bar_index,
                candle.bucket,
                TransitionReason::Ambiguity,
                None,
            )?;
            self.log_transition(&record).await?;
            return Ok(());
        }

        if self.trades_limit_reached() {
            return Ok(());
        }

        let assume = self.params.assume_position_immediately;
        let long_fires = long_met
            && (assume || !self.feed.get_previous_condition_met(ConditionType::LongEntry));
        if long_fires {
            self.enter_position(
                TradeDirection::Long,
                bar_index,
                candle,
                TransitionReason::EntrySignal,
            )
            .await?;
            return Ok(());
        }

        let short_fires = short_met
            && (assume || !self.feed.get_previous_condition_met(ConditionType::ShortEntry));
        if short_fires {
            self.enter_position(
                TradeDirection::Short,
                bar_index,
                candle,
                TransitionReason::EntrySignal,
            )
            .await?;
        }

        Ok(())
    }

    async fn handle_timeout(
        &mut self,
        bar_index: usize,
        candle: &Candle,
    ) -> Result<(), BacktestError> {
        self.machine.tick_timeout();
        let ctx = match self.machine.timeout_context() {
            Some(ctx) => ctx,
            None => {
                warn!("in TIMEOUT without context, returning to CASH");
                let record = self.machine.transition(
                    PositionState::Cash,
                    bar_index,
                    candle.bucket,
                    TransitionReason::CooldownElapsed,
                    None,
                )?;
                self.log_transition(&record).await?;
                return Ok(());
            }
        };

        let verdict = evaluate_timeout(&TimeoutInputs {
            reason: ctx.reason,
            mode: self.params.timeout.mode,
            cooldown_bars: self.params.timeout.cooldown_bars,
            bars_in_timeout: ctx.bars_in_timeout,
            long_signal: self.feed.evaluate_condition(ConditionType::LongEntry),
            short_signal: self.feed.evaluate_condition(ConditionType::ShortEntry),
            previous_direction: ctx.previous_direction,
            algo_type: self.params.algo_type,
        });

        match verdict {
            TimeoutVerdict::Stay => Ok(()),
            TimeoutVerdict::ToCash => {
                let record = self.machine.transition(
                    PositionState::Cash,
                    bar_index,
                    candle.bucket,
                    TransitionReason::CooldownElapsed,
                    None,
                )?;
                self.log_transition(&record).await
            }
            TimeoutVerdict::Enter(direction) => {
                if self.trades_limit_reached() {
                    let record = self.machine.transition(
                        PositionState::Cash,
                        bar_index,
                        candle.bucket,
                        TransitionReason::CooldownElapsed,
                        None,
                    )?;
                    return self.log_transition(&record).await;
                }
                // the entry happens on this same bar
                self.enter_position(
                    direction,
                    bar_index,
                    candle,
                    TransitionReason::CooldownEntry,
                )
                .await
            }
        }
    }

    fn position_size_usd(&self, capital: f64, timestamp: i64) -> f64 {
        let cfg = &self.params.position_size;
        match cfg.value_type {
            ValueType::Abs => (cfg.value * self.run.capital_scaler).min(capital),
            ValueType::Rel => capital * cfg.value,
            ValueType::Dyn => {
                let scale = self
                    .factor_for(cfg)
                    .and_then(|series| series.lookup(timestamp))
                    .map(|v| {
                        if cfg.inverted {
                            (100.0 - v) / 100.0
                        } else {
                            v / 100.0
                        }
                    })
                    // undefined factor degrades to REL sizing
                    .unwrap_or(1.0);
                capital * cfg.value * scale
            }
        }
    }

    fn factor_for(&self, cfg: &ValueConfig) -> Option<Arc<ValueFactorSeries>> {
        cfg.value_factor
            .as_ref()
            .and_then(|spec| self.value_factors.get(&spec.cache_key()).cloned())
    }

    fn build_specials(&self, direction: TradeDirection) -> Vec<Box<dyn SpecialIndicator>> {
        let cond = match direction {
            TradeDirection::Long => &self.params.long_exit,
            TradeDirection::Short => &self.params.short_exit,
        };
        let Some(cond) = cond else {
            return Vec::new();
        };

        let mut specials: Vec<Box<dyn SpecialIndicator>> = Vec::new();
        if let Some(sl) = &cond.stop_loss {
            let policy = LevelPolicy::new(sl.clone(), direction, self.factor_for(sl));
            if cond.trailing_sl {
                specials.push(Box::new(TrailingStop::new(policy)));
            } else {
                specials.push(Box::new(StopLoss::new(policy)));
            }
        }
        if let Some(tp) = &cond.take_profit {
            let policy = LevelPolicy::new(tp.clone(), direction, self.factor_for(tp));
            specials.push(Box::new(TakeProfit::new(policy)));
        }
        specials
    }

    async fn enter_position(
        &mut self,
        direction: TradeDirection,
        bar_index: usize,
        candle: &Candle,
        reason: TransitionReason,
    ) -> Result<(), BacktestError> {
        let capital = self.executor.get_balance().await;
        let size_usd = self.position_size_usd(capital, candle.bucket);
        if size_usd <= 0.0 {
            warn!(bar_index, "computed position size is zero, skipping entry");
            return Ok(());
        }

        let side = match direction {
            TradeDirection::Long => Side::Buy,
            TradeDirection::Short => Side::Sell,
        };
        let mut request = OrderRequest::market(
            self.next_order_id("entry", bar_index),
            self.symbol.clone(),
            side,
            size_usd,
        );
        request.is_entry = Some(true);
        request.trade_direction = Some(direction);

        let result = self.executor.place_order(request).await;
        self.flush_swaps().await?;
        if result.status == OrderStatus::Rejected {
            warn!(
                bar_index,
                reason = result.reject_reason.as_deref().unwrap_or("unknown"),
                "entry order rejected"
            );
            return Ok(());
        }

        let to = match direction {
            TradeDirection::Long => PositionState::Long,
            TradeDirection::Short => PositionState::Short,
        };
        let record =
            self.machine
                .transition(to, bar_index, candle.bucket, reason, Some(direction))?;
        self.log_transition(&record).await?;

        self.specials = self.build_specials(direction);
        let levels: Vec<(SpecialIndicatorKind, f64)> = self
            .specials
            .iter_mut()
            .map(|special| {
                special.reset(result.avg_price, candle.bucket);
                (special.kind(), special.get_level())
            })
            .collect();
        for (kind, level) in levels {
            self.log_level_event(kind, bar_index, candle.bucket, level)
                .await?;
        }

        debug!(
            bar_index,
            ?direction,
            price = result.avg_price,
            size_usd,
            "entered position"
        );
        Ok(())
    }

    async fn exit_position(
        &mut self,
        direction: TradeDirection,
        bar_index: usize,
        candle: &Candle,
        reason: TransitionReason,
        pinned_level: Option<f64>,
        trigger_price: Option<f64>,
    ) -> Result<(), BacktestError> {
        let position = match self.executor.get_position(&self.symbol).await {
            Some(pos) => pos,
            None => {
                warn!(bar_index, "exit requested with no open position");
                return Ok(());
            }
        };

        let side = match direction {
            TradeDirection::Long => Side::Sell,
            TradeDirection::Short => Side::Buy,
        };
        let mut request = OrderRequest::market(
            self.next_order_id("exit", bar_index),
            self.symbol.clone(),
            side,
            0.0,
        );
        request.amount_usd = None;
        request.amount_asset = Some(position.size);
        request.limit_price = pinned_level;
        request.is_entry = Some(false);
        request.trade_direction = Some(direction);

        let result = self.executor.place_order(request).await;
        self.flush_swaps().await?;
        if result.status == OrderStatus::Rejected {
            warn!(
                bar_index,
                reason = result.reject_reason.as_deref().unwrap_or("unknown"),
                "exit order rejected"
            );
            return Ok(());
        }

        if let Some(level) = pinned_level {
            let hit = match reason {
                TransitionReason::TrailingStop => AlgoEvent::TrailingHit {
                    timestamp: candle.bucket,
                    bar_index,
                    level,
                    trigger_price: trigger_price.unwrap_or(level),
                },
                TransitionReason::TakeProfit => AlgoEvent::TpHit {
                    timestamp: candle.bucket,
                    bar_index,
                    level,
                    trigger_price: trigger_price.unwrap_or(level),
                },
                _ => AlgoEvent::SlHit {
                    timestamp: candle.bucket,
                    bar_index,
                    level,
                    trigger_price: trigger_price.unwrap_or(level),
                },
            };
            self.event_log.log_algo_event(hit).await?;
        }

        let record = self.machine.transition(
            PositionState::Timeout,
            bar_index,
            candle.bucket,
            reason,
            Some(direction),
        )?;
        self.log_transition(&record).await?;

        self.specials.clear();
        self.trades_completed += 1;
        debug!(
            bar_index,
            ?direction,
            ?reason,
            price = result.avg_price,
            "exited position"
        );
        Ok(())
    }

    async fn log_level_event(
        &mut self,
        kind: SpecialIndicatorKind,
        bar_index: usize,
        timestamp: i64,
        level: f64,
    ) -> Result<(), BacktestError> {
        let event = match kind {
            SpecialIndicatorKind::StopLoss => AlgoEvent::SlSet {
                timestamp,
                bar_index,
                level,
            },
            SpecialIndicatorKind::TakeProfit => AlgoEvent::TpSet {
                timestamp,
                bar_index,
                level,
            },
            SpecialIndicatorKind::TrailingStop => AlgoEvent::TrailingUpdate {
                timestamp,
                bar_index,
                level,
            },
        };
        self.event_log.log_algo_event(event).await
    }

    async fn log_transition(
        &mut self,
        record: &crate::sim::state::TransitionRecord,
    ) -> Result<(), BacktestError> {
        self.event_log
            .log_algo_event(AlgoEvent::StateTransition {
                timestamp: record.timestamp,
                bar_index: record.bar_index,
                from: record.from,
                to: record.to,
                reason: record.reason,
                direction: record.direction,
                timeout: record.timeout,
            })
            .await
    }

    async fn flush_swaps(&mut self) -> Result<(), BacktestError> {
        for swap in self.executor.drain_swaps() {
            self.event_log.log_swap_event(swap).await?;
        }
        Ok(())
    }
}
