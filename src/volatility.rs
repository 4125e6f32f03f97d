//! Average True Range volatility estimation
//!
//! True Range for a bar is the greatest of:
//! - high - low
//! - |high - previous close|
//! - |low - previous close|
//!
//! ATR here is the arithmetic mean of the last `period` true ranges, which
//! is what drives the adaptive grid spacing.

use crate::errors::{Error, Result};

/// A single price bar (kline)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn new(high: f64, low: f64, close: f64) -> Self {
        Self { high, low, close }
    }
}

/// Default ATR lookback period
pub const DEFAULT_ATR_PERIOD: usize = 14;

/// Calculate ATR over the most recent `period` bars.
///
/// Requires at least `period + 1` bars (the first true range needs a
/// previous close). Pure computation, no I/O.
pub fn atr(bars: &[Bar], period: usize) -> Result<f64> {
    if period == 0 {
        return Err(Error::InvalidConfig("ATR period must be positive".into()));
    }

    if bars.len() < period + 1 {
        return Err(Error::InsufficientData {
            have: bars.len(),
            need: period + 1,
        });
    }

    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        true_ranges.push(tr);
    }

    let window = &true_ranges[true_ranges.len() - period..];
    Ok(window.iter().sum::<f64>() / period as f64)
}
