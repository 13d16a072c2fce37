// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
// line      = EMA(fast) - EMA(slow)
// signal    = EMA(signal) of the line
// histogram = line - signal
// =============================================================================

use serde::{Deserialize, Serialize};

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdReading {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Prices needed before the signal line has its first value.
pub fn min_samples(slow: usize, signal: usize) -> usize {
    slow + signal.saturating_sub(1)
}

/// MACD line aligned to the slow EMA (first value at index `slow - 1`).
pub fn macd_line(prices: &[f64], fast: usize, slow: usize) -> Vec<f64> {
    if fast == 0 || fast >= slow {
        return Vec::new();
    }

    let fast_ema = calculate_ema(prices, fast);
    let slow_ema = calculate_ema(prices, slow);
    let offset = slow - fast;
    if fast_ema.len() <= offset {
        return Vec::new();
    }

    fast_ema[offset..]
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| f - s)
        .collect()
}

/// Latest MACD reading, or `None` with fewer than `slow + signal - 1` prices.
pub fn latest_macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdReading> {
    if signal == 0 || prices.len() < min_samples(slow, signal) {
        return None;
    }

    let line = macd_line(prices, fast, slow);
    let signal_series = calculate_ema(&line, signal);

    let macd = *line.last()?;
    let signal = *signal_series.last()?;

    Some(MacdReading {
        macd,
        signal,
        histogram: macd - signal,
    })
}
