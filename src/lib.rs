//! Algo Backtest
//!
//! A deterministic, bar-driven backtesting engine for indicator-based
//! trading algorithms over OHLCV candle streams. Strategies are declared as
//! entry/exit indicator conditions with position sizing, stop-loss /
//! take-profit / trailing-stop policies, and cooldown rules; the engine
//! replays them bar by bar and emits a full event log, trade ledger, equity
//! curve, and performance metrics.

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod eventlog;
pub mod indicators;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod sim;
pub mod types;

pub use backtest::{BacktestOutput, Backtester};
pub use config::{
    AlgoCondition, AlgoParams, AlgoType, BacktestInput, IndicatorKind, IndicatorSpec,
    PriceSource, RunSettings, TimeoutConfig, TimeoutMode, ValueConfig, ValueType,
};
pub use error::BacktestError;
pub use types::*;
