//! Error taxonomy for the backtesting engine
//!
//! Structural errors (bad config, bad data, forbidden transitions) abort the
//! run. Local conditions (insufficient capital, unknown cache keys, exits
//! without a pending entry) are absorbed where they occur and surface only as
//! warnings or event-log entries.

use thiserror::Error;

use crate::types::PositionState;

/// Fatal errors that abort a backtest run.
#[derive(Debug, Error)]
pub enum BacktestError {
    /// Schema-level configuration failure, raised before any simulation work.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Candle stream violates an invariant (finiteness, OHLC relation,
    /// ascending buckets).
    #[error("invalid candle data at index {index}: {reason}")]
    InvalidCandleData { index: usize, reason: String },

    /// A forbidden state-machine transition was attempted. Indicates a bug in
    /// the runner, not in user input.
    #[error("illegal state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: PositionState,
        to: PositionState,
    },

    /// A DYN value config references an indicator without normalized
    /// (0-100) output.
    #[error("value factor '{0}' is not a normalized indicator")]
    UnsupportedValueFactor(String),

    /// Unknown indicator kind or malformed indicator parameters.
    #[error("indicator error: {0}")]
    Indicator(String),

    /// Failure in the persistent event-log store.
    #[error("event store error: {0}")]
    EventStore(#[from] rusqlite::Error),

    /// Event or state payload failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BacktestError>;
