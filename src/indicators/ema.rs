// =============================================================================
// Moving averages — SMA and EMA
// =============================================================================
//
// SMA_t = mean(p_{t-period+1} ..= p_t)
// EMA_t = p_t * k + EMA_{t-1} * (1 - k),   k = 2 / (period + 1)
//
// The first EMA value is the SMA of the first `period` prices, so both series
// start at index `period - 1`.
// =============================================================================

/// Rolling simple moving average. One value per price from index
/// `period - 1`; empty when there is not enough data.
pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let n = period as f64;
    let mut sum: f64 = prices[..period].iter().sum();
    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(sum / n);

    for i in period..prices.len() {
        sum += prices[i] - prices[i - period];
        series.push(sum / n);
    }

    series
}

/// Exponential moving average seeded from the SMA of the first `period`
/// prices. A non-finite intermediate truncates the series.
pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = prices[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(seed);

    let mut prev = seed;
    for &p in &prices[period..] {
        let ema = p * k + prev * (1.0 - k);
        if !ema.is_finite() {
            break;
        }
        series.push(ema);
        prev = ema;
    }

    series
}

pub fn latest_sma(prices: &[f64], period: usize) -> Option<f64> {
    calculate_sma(prices, period).last().copied()
}

pub fn latest_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema(prices, period).last().copied()
}
