//! Pipeline + simulation benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use algo_backtest::backtest::Backtester;
use algo_backtest::config::{
    AlgoCondition, AlgoParams, AlgoType, BacktestInput, IndicatorKind, IndicatorSpec, OrderKind,
    RunSettings, TimeoutConfig, TimeoutMode, ValueConfig,
};
use algo_backtest::types::{Candle, Timeframe};

fn synthetic_candles(count: usize) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let px = 100.0 + (i as f64 * 0.05).sin() * 10.0 + i as f64 * 0.001;
            Candle::new_unchecked(i as i64 * 300, px, px + 0.5, px - 0.5, px, 1000.0)
        })
        .collect()
}

fn rsi_input() -> BacktestInput {
    BacktestInput {
        algo: AlgoParams {
            algo_type: AlgoType::Long,
            coin_symbol: "BTC".to_string(),
            starting_capital_usd: 10_000.0,
            position_size: ValueConfig::rel(0.1),
            order_type: OrderKind::Market,
            long_entry: Some(AlgoCondition::new(vec![IndicatorSpec::new(
                IndicatorKind::Rsi,
                Timeframe::M5,
            )
            .with_param("period", 14.0)
            .with_param("threshold", 35.0)
            .with_param("below", 1.0)])),
            long_exit: Some(AlgoCondition {
                required: vec![IndicatorSpec::new(IndicatorKind::Rsi, Timeframe::M5)
                    .with_param("period", 14.0)
                    .with_param("threshold", 65.0)
                    .with_param("below", 0.0)],
                optional: vec![],
                stop_loss: Some(ValueConfig::rel(0.03)),
                take_profit: Some(ValueConfig::rel(0.05)),
                trailing_sl: false,
            }),
            short_entry: None,
            short_exit: None,
            timeout: TimeoutConfig {
                mode: TimeoutMode::CooldownOnly,
                cooldown_bars: 2,
            },
            assume_position_immediately: false,
        },
        run: RunSettings::default(),
        fee_bps: 10.0,
        slippage_bps: 5.0,
    }
}

fn bench_full_backtest(c: &mut Criterion) {
    let candles = synthetic_candles(5000);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    c.bench_function("backtest_5000_bars_rsi", |b| {
        b.iter(|| {
            let backtester = Backtester::new(rsi_input());
            let output = runtime
                .block_on(backtester.run(black_box(&candles)))
                .expect("backtest");
            black_box(output.swap_metrics.total_trades)
        })
    });
}

criterion_group!(benches, bench_full_backtest);
criterion_main!(benches);
