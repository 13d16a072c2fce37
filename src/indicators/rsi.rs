// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
//   deltas    d_i = p_i - p_{i-1}
//   seed      avg_gain / avg_loss = mean of the first `period` gains / losses
//   smoothing avg = (prev_avg * (period - 1) + current) / period
//   RSI       100 - 100 / (1 + avg_gain / avg_loss)
//
// Zones: RSI >= 70 overbought, RSI <= 30 oversold, otherwise normal.
// =============================================================================

use serde::{Deserialize, Serialize};

pub const OVERBOUGHT: f64 = 70.0;
pub const OVERSOLD: f64 = 30.0;

/// Classification attached to an RSI reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiZone {
    Overbought,
    Oversold,
    Normal,
    /// Fewer than `period + 1` samples.
    Unavailable,
}

impl RsiZone {
    pub fn classify(value: f64) -> Self {
        if value >= OVERBOUGHT {
            Self::Overbought
        } else if value <= OVERSOLD {
            Self::Oversold
        } else {
            Self::Normal
        }
    }
}

/// Minimum number of prices needed before RSI(`period`) has a value.
pub fn min_samples(period: usize) -> usize {
    period + 1
}

/// Full RSI series: one value per price from index `period` onwards.
///
/// Empty when `period == 0` or there are fewer than `period + 1` prices.
/// A non-finite intermediate truncates the series.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < min_samples(period) {
        return Vec::new();
    }

    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let (seed_gain, seed_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });

    let n = period as f64;
    let mut avg_gain = seed_gain / n;
    let mut avg_loss = seed_loss / n;

    let mut series = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_from_averages(avg_gain, avg_loss) {
        Some(v) => series.push(v),
        None => return series,
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (n - 1.0) + gain) / n;
        avg_loss = (avg_loss * (n - 1.0) + loss) / n;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(v) => series.push(v),
            None => break,
        }
    }

    series
}

/// Latest RSI value with its zone, or `None` when unavailable.
pub fn latest_rsi(prices: &[f64], period: usize) -> Option<(f64, RsiZone)> {
    let value = *calculate_rsi(prices, period).last()?;
    Some((value, RsiZone::classify(value)))
}

/// RSI in [0, 100]; flat input is 50, loss-free input is 100.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    rsi.is_finite().then_some(rsi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn unavailable_below_period_plus_one() {
        assert!(calculate_rsi(&rising(14), 14).is_empty());
        assert!(latest_rsi(&rising(14), 14).is_none());
        assert_eq!(calculate_rsi(&rising(15), 14).len(), 1);
    }

    #[test]
    fn zero_period_is_empty() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn monotonic_rise_is_overbought() {
        let (value, zone) = latest_rsi(&rising(15), 14).unwrap();
        assert!(value > 50.0);
        assert_eq!(zone, RsiZone::Overbought);
    }

    #[test]
    fn monotonic_fall_is_oversold() {
        let prices: Vec<f64> = rising(40).into_iter().rev().collect();
        let (value, zone) = latest_rsi(&prices, 14).unwrap();
        assert!(value.abs() < 1e-10);
        assert_eq!(zone, RsiZone::Oversold);
    }

    #[test]
    fn flat_series_is_fifty() {
        let (value, zone) = latest_rsi(&[250.0; 30], 14).unwrap();
        assert!((value - 50.0).abs() < 1e-10);
        assert_eq!(zone, RsiZone::Normal);
    }

    #[test]
    fn always_within_bounds() {
        let prices = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 43.90, 44.75, 44.02, 43.77,
        ];
        let series = calculate_rsi(&prices, 14);
        assert_eq!(series.len(), prices.len() - 14);
        for v in series {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn zone_boundaries_are_inclusive() {
        assert_eq!(RsiZone::classify(70.0), RsiZone::Overbought);
        assert_eq!(RsiZone::classify(30.0), RsiZone::Oversold);
        assert_eq!(RsiZone::classify(50.0), RsiZone::Normal);
    }
}
