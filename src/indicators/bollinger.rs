// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(period) over the trailing window
// upper  = middle + k * σ,  lower = middle - k * σ   (population σ)
// widthPct = (upper - lower) / middle * 100

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// `None` on a zero middle band.
    pub width_pct: Option<f64>,
}

fn width_pct(upper: f64, middle: f64, lower: f64) -> Option<f64> {
    if middle == 0.0 {
        return None;
    }
    let w = (upper - lower) / middle * 100.0;
    w.is_finite().then_some(w)
}

/// Bands over the last `period` prices. `None` with fewer than `period`
/// prices or on non-finite input.
pub fn calculate_bollinger(prices: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let window = &prices[prices.len() - period..];
    let n = period as f64;
    let middle = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / n;
    let sigma = variance.sqrt();

    let (upper, lower) = (middle + k * sigma, middle - k * sigma);
    let bands = BollingerBands {
        upper,
        middle,
        lower,
        width_pct: width_pct(upper, middle, lower),
    };

    (bands.upper.is_finite() && bands.lower.is_finite()).then_some(bands)
}
