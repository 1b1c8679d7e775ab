//! Bar-driven simulation core
//!
//! The position state machine, special (protective) indicators, simulated
//! executor, backtest indicator feed, event collector, and the per-bar
//! algorithm runner that ties them together.

pub mod collector;
pub mod executor;
pub mod feed;
pub mod runner;
pub mod special;
pub mod state;

pub use collector::EventCollector;
pub use executor::SimulatedExecutor;
pub use feed::BacktestSignalFeed;
pub use runner::AlgoRunner;
pub use special::{SpecialIndicator, SpecialIndicatorKind};
pub use state::{evaluate_timeout, StateMachine, TimeoutInputs, TimeoutVerdict};
