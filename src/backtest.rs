//! Backtest orchestration
//!
//! Wires the pipeline stages to the runner: validate input, pre-calculate
//! indicators, resample onto the simulation grid, expand sub-bars, then
//! drive the bar loop and fold the run into a [`BacktestOutput`]. Every run
//! builds its own executor, event log, feed, and state machine; nothing is
//! shared across runs.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{BacktestInput, ValueType};
use crate::data::{aggregate_candles, slice_by_time, validate_candles};
use crate::error::BacktestError;
use crate::eventlog::MemoryEventLog;
use crate::metrics::{
    compute_algo_metrics, compute_swap_metrics, AlgoMetrics, AlgoMetricsInput, SwapMetrics,
};
use crate::pipeline::precalc::{precalculate, IndicatorFactory, TaIndicatorFactory};
use crate::pipeline::resample::{build_grid, resample, simulation_resolution};
use crate::pipeline::subbar::{precalc_value_factor, SyntheticSubBarProvider, ValueFactorSeries};
use crate::ports::{EventFilter, EventLogPort, SubBarProvider};
use crate::sim::executor::SimulatedExecutor;
use crate::sim::feed::BacktestSignalFeed;
use crate::sim::runner::AlgoRunner;
use crate::types::{AlgoEvent, Candle, EquityPoint, SwapEvent, Timeframe, TradeEvent};

/// Everything one backtest run produces.
#[derive(Debug, Serialize)]
pub struct BacktestOutput {
    pub symbol: String,
    pub simulation_resolution_secs: i64,
    pub warmup_bars: usize,
    pub bars_processed: usize,
    pub starting_equity: f64,
    pub final_equity: f64,
    pub events: Vec<AlgoEvent>,
    pub swaps: Vec<SwapEvent>,
    pub trades: Vec<TradeEvent>,
    pub equity_curve: Vec<EquityPoint>,
    pub swap_metrics: SwapMetrics,
    pub algo_metrics: AlgoMetrics,
}

/// One-shot backtest over a candle stream.
pub struct Backtester {
    input: BacktestInput,
    factory: Box<dyn IndicatorFactory>,
    event_log: Option<Box<dyn EventLogPort>>,
    sub_bar_provider: Option<Box<dyn SubBarProvider>>,
}

impl Backtester {
    pub fn new(input: BacktestInput) -> Self {
        Backtester {
            input,
            factory: Box::new(TaIndicatorFactory),
            event_log: None,
            sub_bar_provider: None,
        }
    }

    pub fn with_factory(mut self, factory: Box<dyn IndicatorFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_event_log(mut self, event_log: Box<dyn EventLogPort>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn with_sub_bar_provider(mut self, provider: Box<dyn SubBarProvider>) -> Self {
        self.sub_bar_provider = Some(provider);
        self
    }

    /// Run the full pipeline and simulation.
    pub async fn run(self, candles: &[Candle]) -> Result<BacktestOutput, BacktestError> {
        self.input.validate()?;
        validate_candles(candles)?;

        let input = self.input;
        let symbol = input.algo.coin_symbol.clone();
        let sliced = slice_by_time(candles, input.run.start_time, input.run.end_time);
        if sliced.is_empty() {
            return Err(BacktestError::InvalidCandleData {
                index: 0,
                reason: "no candles inside the configured time range".to_string(),
            });
        }

        // C1: indicator pre-calculation
        let specs = input.algo.condition_specs();
        let precalc = precalculate(&sliced, &specs, self.factory.as_ref())?;

        // C2: resample onto the simulation grid
        let resolution = simulation_resolution(&precalc);
        let sim_candles = aggregate_candles(&sliced, resolution);
        let grid = build_grid(&sim_candles, resolution, precalc.warmup_candles);
        let warmup_bars = grid.warmup_bars;
        let resampled = resample(&precalc, grid);
        info!(
            resolution_secs = resolution,
            bars = sim_candles.len(),
            warmup_bars,
            indicators = precalc.series.len(),
            "simulation grid prepared"
        );

        // C3: sub-bar expansion
        let sim_tf = Timeframe::from_secs(resolution);
        let provider: Box<dyn SubBarProvider> = match self.sub_bar_provider {
            Some(provider) => provider,
            None => Box::new(SyntheticSubBarProvider::new(&sim_candles)),
        };
        let sub_bars: HashMap<i64, Vec<Candle>> = match sim_tf {
            Some(tf) if tf.sub_timeframe().is_some() => {
                let timestamps: Vec<i64> = sim_candles.iter().map(|c| c.bucket).collect();
                provider
                    .get_sub_bar_candles_batch(&symbol, &timestamps, tf)
                    .await
            }
            _ => HashMap::new(),
        };

        // C3: value factors for DYN sizing and stops, over the flattened
        // sub-bar stream (the bar stream itself when there are no sub-bars)
        let mut flattened: Vec<Candle> = Vec::new();
        for candle in &sim_candles {
            if let Some(subs) = sub_bars.get(&candle.bucket) {
                flattened.extend(subs.iter().cloned());
            }
        }
        let factor_stream: &[Candle] = if flattened.is_empty() {
            &sim_candles
        } else {
            &flattened
        };

        let mut value_factors: HashMap<String, Arc<ValueFactorSeries>> = HashMap::new();
        for cfg in input.algo.dyn_value_configs() {
            if cfg.value_type != ValueType::Dyn {
                continue;
            }
            let spec = match &cfg.value_factor {
                Some(spec) => spec,
                None => continue,
            };
            let key = spec.cache_key();
            if value_factors.contains_key(&key) {
                continue;
            }
            if let Some(series) = precalc_value_factor(
                spec,
                self.factory.as_ref(),
                factor_stream,
                input.run.degrade_dyn_to_rel,
            )? {
                value_factors.insert(key, Arc::new(series));
            }
        }

        // C4-C6: assemble the run
        let executor = SimulatedExecutor::new(
            symbol.clone(),
            input.algo.starting_capital_usd * input.run.capital_scaler,
            input.fee_bps,
            input.slippage_bps,
        );
        let starting_equity = input.algo.starting_capital_usd * input.run.capital_scaler;
        let event_log: Box<dyn EventLogPort> = match self.event_log {
            Some(log) => log,
            None => Box::new(MemoryEventLog::new()),
        };
        let feed = BacktestSignalFeed::new(resampled, &input.algo);

        let mut runner = AlgoRunner::new(
            input.algo.clone(),
            input.run.clone(),
            warmup_bars,
            Box::new(executor),
            event_log,
            feed,
            value_factors,
        );

        // C5: the bar loop
        for (i, candle) in sim_candles.iter().enumerate() {
            let subs = sub_bars.get(&candle.bucket).map(Vec::as_slice).unwrap_or(&[]);
            runner.process_bar(i, candle, subs).await?;
        }
        if let Some(last) = sim_candles.last() {
            runner.finish(sim_candles.len() - 1, last).await?;
        }

        // C7: fold the run into metrics
        let mut artifacts = runner.into_artifacts();
        let events = artifacts
            .event_log
            .get_algo_events(&EventFilter::default())
            .await?;
        let swaps = artifacts
            .event_log
            .get_swap_events(&EventFilter::default())
            .await?;
        let trades = artifacts.collector.pair_trades(&swaps, &symbol);
        let final_equity = artifacts.executor.get_balance().await;

        let swap_metrics = compute_swap_metrics(&trades, &swaps, artifacts.collector.equity_curve());
        let algo_metrics = compute_algo_metrics(&AlgoMetricsInput {
            events: &events,
            total_bars: sim_candles.len(),
            tracked: artifacts.collector.tracked_keys(),
            final_signals: artifacts.collector.signal_states(),
            distances: artifacts.collector.distances(),
            blocking: artifacts.collector.blocking_counts(),
            state_bars: artifacts.collector.state_bars(),
        });

        info!(
            trades = trades.len(),
            final_equity,
            return_pct = swap_metrics.total_return_pct,
            "backtest complete"
        );

        Ok(BacktestOutput {
            symbol,
            simulation_resolution_secs: resolution,
            warmup_bars,
            bars_processed: sim_candles.len(),
            starting_equity,
            final_equity,
            events,
            swaps,
            trades,
            equity_curve: artifacts.collector.equity_curve().to_vec(),
            swap_metrics,
            algo_metrics,
        })
    }
}
