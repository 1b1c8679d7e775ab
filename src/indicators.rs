//! Technical indicator arrays powered by the `ta` crate
//!
//! Thin wrappers that evaluate one indicator over a full price series and
//! return per-bar values, with `None` during the warmup window. The
//! indicator factory in the pre-calculation stage builds its boolean signal
//! streams on top of these.

use ta::indicators::{
    BollingerBands as TaBB, ExponentialMovingAverage, FastStochastic, MoneyFlowIndex as TaMFI,
    MovingAverageConvergenceDivergence, RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::{DataItem, Next};

/// Band indicator output: (upper, middle, lower).
pub type BandOutput = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// Two-line indicator output.
pub type DualLineOutput = (Vec<Option<f64>>, Vec<Option<f64>>);

/// Create a DataItem from OHLCV data for use with `ta` indicators.
pub fn make_data_item(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Option<DataItem> {
    DataItem::builder()
        .open(open)
        .high(high)
        .low(low)
        .close(close)
        .volume(volume)
        .build()
        .ok()
}

/// Simple Moving Average.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let out = indicator.next(value);
        result.push((i + 1 >= period).then_some(out));
    }
    result
}

/// Exponential Moving Average.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let out = indicator.next(value);
        result.push((i + 1 >= period).then_some(out));
    }
    result
}

/// Relative Strength Index, 0-100.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let out = indicator.next(value);
        result.push((i + 1 >= period).then_some(out));
    }
    result
}

/// Bollinger Bands.
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BandOutput {
    if values.is_empty() || period == 0 {
        return (vec![], vec![], vec![]);
    }

    let mut indicator = match TaBB::new(period, num_std) {
        Ok(i) => i,
        Err(_) => {
            return (
                vec![None; values.len()],
                vec![None; values.len()],
                vec![None; values.len()],
            )
        }
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let bb = indicator.next(value);
        let warm = i + 1 >= period;
        upper.push(warm.then_some(bb.upper));
        middle.push(warm.then_some(bb.average));
        lower.push(warm.then_some(bb.lower));
    }

    (upper, middle, lower)
}

/// MACD line and signal line. Warmup is the slow period.
pub fn macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> DualLineOutput {
    if values.is_empty() {
        return (vec![], vec![]);
    }

    let mut indicator =
        match MovingAverageConvergenceDivergence::new(fast_period, slow_period, signal_period) {
            Ok(i) => i,
            Err(_) => return (vec![None; values.len()], vec![None; values.len()]),
        };

    let warmup = slow_period;
    let mut macd_line = Vec::with_capacity(values.len());
    let mut signal_line = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let out = indicator.next(value);
        let warm = i + 1 >= warmup;
        macd_line.push(warm.then_some(out.macd));
        signal_line.push(warm.then_some(out.signal));
    }

    (macd_line, signal_line)
}

/// Fast Stochastic %K over high/low/close.
pub fn stochastic_k(high: &[f64], low: &[f64], close: &[f64], k_period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    let mut indicator = match FastStochastic::new(k_period) {
        Ok(i) => i,
        Err(_) => return vec![None; high.len()],
    };

    let mut result = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        let out = match make_data_item(close[i], high[i], low[i], close[i], 0.0) {
            Some(item) => Some(indicator.next(&item)),
            None => None,
        };
        result.push(if i + 1 >= k_period { out } else { None });
    }
    result
}

/// Money Flow Index, 0-100.
pub fn mfi(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    volume: &[f64],
    period: usize,
) -> Vec<Option<f64>> {
    if high.is_empty()
        || high.len() != low.len()
        || high.len() != close.len()
        || high.len() != volume.len()
    {
        return vec![];
    }

    let mut indicator = match TaMFI::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; high.len()],
    };

    let mut result = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        let out = match make_data_item(close[i], high[i], low[i], close[i], volume[i]) {
            Some(item) => Some(indicator.next(&item)),
            None => None,
        };
        result.push(if i + 1 >= period { out } else { None });
    }
    result
}

/// Williams %R on the native -100..0 scale.
pub fn williams_r(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 {
        return vec![];
    }

    let mut result = Vec::with_capacity(close.len());
    for i in 0..close.len() {
        if i + 1 < period {
            result.push(None);
            continue;
        }
        let window_high = high[i + 1 - period..=i]
            .iter()
            .fold(f64::MIN, |a, &b| a.max(b));
        let window_low = low[i + 1 - period..=i]
            .iter()
            .fold(f64::MAX, |a, &b| a.min(b));

        let range = window_high - window_low;
        if range > 0.0 {
            result.push(Some(((window_high - close[i]) / range) * -100.0));
        } else {
            result.push(Some(-50.0));
        }
    }
    result
}
