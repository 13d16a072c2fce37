// =============================================================================
// Indicator Engine — builds a full IndicatorSnapshot from a price history
// =============================================================================
//
// The snapshot is a fresh value on every call; consumers swap it in whole.
// Each indicator applies its own minimum-sample guard and reports
// `unavailable` instead of a value computed from too little data.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::bollinger::{calculate_bollinger, BollingerBands};
use super::ema::{latest_ema, latest_sma};
use super::macd::{self, latest_macd, MacdReading};
use super::rsi::{self, latest_rsi, RsiZone};
use crate::types::{now_ms, PriceSample};

/// Indicator groups a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorFamily {
    Rsi,
    MovingAverages,
    Bollinger,
    Macd,
}

impl IndicatorFamily {
    pub const ALL: [IndicatorFamily; 4] = [
        IndicatorFamily::Rsi,
        IndicatorFamily::MovingAverages,
        IndicatorFamily::Bollinger,
        IndicatorFamily::Macd,
    ];

    pub fn all() -> HashSet<IndicatorFamily> {
        Self::ALL.into_iter().collect()
    }
}

/// A value that is either computed or explicitly unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Reading<T> {
    Available(T),
    Unavailable,
}

impl<T> Reading<T> {
    pub fn from_option(v: Option<T>) -> Self {
        match v {
            Some(v) => Self::Available(v),
            None => Self::Unavailable,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Available(v) => Some(v),
            Self::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiEntry {
    pub value: Option<f64>,
    pub status: RsiZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePosition {
    Above,
    Below,
    At,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovingAverageEntry {
    pub value: f64,
    pub price_position: PricePosition,
    pub deviation_pct: f64,
}

impl MovingAverageEntry {
    fn relative_to(price: f64, ma: f64) -> Self {
        let price_position = if price > ma {
            PricePosition::Above
        } else if price < ma {
            PricePosition::Below
        } else {
            PricePosition::At
        };
        let deviation_pct = if ma != 0.0 {
            (price - ma) / ma * 100.0
        } else {
            0.0
        };
        Self {
            value: ma,
            price_position,
            deviation_pct,
        }
    }
}

/// Indicator values for one symbol at one point in time. Families the
/// consumer did not ask for are `None` and omitted from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSnapshot {
    pub symbol: String,
    /// Timestamp of the newest sample the snapshot was computed from.
    pub timestamp: i64,
    pub computed_at: i64,
    pub sample_count: usize,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<BTreeMap<String, RsiEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moving_averages: Option<BTreeMap<String, Reading<MovingAverageEntry>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bollinger: Option<Reading<BollingerBands>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd: Option<Reading<MacdReading>>,
}

impl IndicatorSnapshot {
    /// Copy restricted to `families`.
    pub fn filtered(&self, families: &HashSet<IndicatorFamily>) -> Self {
        let keep = |f: IndicatorFamily| families.contains(&f);
        Self {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            computed_at: self.computed_at,
            sample_count: self.sample_count,
            price: self.price,
            rsi: self.rsi.clone().filter(|_| keep(IndicatorFamily::Rsi)),
            moving_averages: self
                .moving_averages
                .clone()
                .filter(|_| keep(IndicatorFamily::MovingAverages)),
            bollinger: self.bollinger.clone().filter(|_| keep(IndicatorFamily::Bollinger)),
            macd: self.macd.clone().filter(|_| keep(IndicatorFamily::Macd)),
        }
    }

    /// RSI entry for `period`, if computed.
    pub fn rsi_for(&self, period: usize) -> Option<&RsiEntry> {
        self.rsi.as_ref()?.get(&period.to_string())
    }
}

fn default_rsi_periods() -> Vec<usize> {
    vec![14]
}

fn default_sma_periods() -> Vec<usize> {
    vec![20, 50, 200]
}

fn default_ema_periods() -> Vec<usize> {
    vec![12, 26, 50]
}

fn default_bollinger_period() -> usize {
    20
}

fn default_bollinger_k() -> f64 {
    2.0
}

fn default_macd() -> (usize, usize, usize) {
    (12, 26, 9)
}

/// Periods and multipliers the engine computes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    #[serde(default = "default_rsi_periods")]
    pub rsi_periods: Vec<usize>,
    #[serde(default = "default_sma_periods")]
    pub sma_periods: Vec<usize>,
    #[serde(default = "default_ema_periods")]
    pub ema_periods: Vec<usize>,
    #[serde(default = "default_bollinger_period")]
    pub bollinger_period: usize,
    #[serde(default = "default_bollinger_k")]
    pub bollinger_k: f64,
    /// (fast, slow, signal)
    #[serde(default = "default_macd")]
    pub macd: (usize, usize, usize),
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_periods: default_rsi_periods(),
            sma_periods: default_sma_periods(),
            ema_periods: default_ema_periods(),
            bollinger_period: default_bollinger_period(),
            bollinger_k: default_bollinger_k(),
            macd: default_macd(),
        }
    }
}

/// Stateless snapshot builder over the configured parameters.
#[derive(Debug, Clone, Default)]
pub struct IndicatorEngine {
    params: IndicatorParams,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    /// Fewest samples for which at least one indicator is available. Below
    /// this a snapshot would be all `unavailable` and is not worth sending.
    pub fn min_samples(&self) -> usize {
        let p = &self.params;
        let (_, slow, signal) = p.macd;
        p.rsi_periods
            .iter()
            .map(|&n| rsi::min_samples(n))
            .chain(p.sma_periods.iter().copied())
            .chain(p.ema_periods.iter().copied())
            .chain(std::iter::once(p.bollinger_period))
            .chain(std::iter::once(macd::min_samples(slow, signal)))
            .filter(|&n| n > 0)
            .min()
            .unwrap_or(1)
    }

    /// Compute every family from an ordered sample history. `None` for an
    /// empty history.
    pub fn compute(&self, symbol: &str, samples: &[PriceSample]) -> Option<IndicatorSnapshot> {
        let last = samples.last()?;
        let prices: Vec<f64> = samples.iter().map(|s| s.price).collect();
        Some(self.compute_prices(symbol, &prices, last.timestamp))
    }

    /// Compute every family from a bare price series ending at `timestamp`.
    pub fn compute_prices(&self, symbol: &str, prices: &[f64], timestamp: i64) -> IndicatorSnapshot {
        let p = &self.params;
        let price = prices.last().copied().unwrap_or(0.0);

        let rsi = p
            .rsi_periods
            .iter()
            .map(|&period| {
                let entry = match latest_rsi(prices, period) {
                    Some((value, status)) => RsiEntry {
                        value: Some(value),
                        status,
                    },
                    None => RsiEntry {
                        value: None,
                        status: RsiZone::Unavailable,
                    },
                };
                (period.to_string(), entry)
            })
            .collect();

        let sma = p.sma_periods.iter().map(|&period| {
            let reading = latest_sma(prices, period).map(|ma| MovingAverageEntry::relative_to(price, ma));
            (format!("sma{period}"), Reading::from_option(reading))
        });
        let ema = p.ema_periods.iter().map(|&period| {
            let reading = latest_ema(prices, period).map(|ma| MovingAverageEntry::relative_to(price, ma));
            (format!("ema{period}"), Reading::from_option(reading))
        });
        let moving_averages = sma.chain(ema).collect();

        let bollinger = Reading::from_option(calculate_bollinger(prices, p.bollinger_period, p.bollinger_k));
        let (fast, slow, signal) = p.macd;
        let macd = Reading::from_option(latest_macd(prices, fast, slow, signal));

        IndicatorSnapshot {
            symbol: symbol.to_string(),
            timestamp,
            computed_at: now_ms(),
            sample_count: prices.len(),
            price,
            rsi: Some(rsi),
            moving_averages: Some(moving_averages),
            bollinger: Some(bollinger),
            macd: Some(macd),
        }
    }
}
