// =============================================================================
// Cold-start seeding of price history from exchange klines
// =============================================================================
//
// On startup each symbol's history is pre-filled with recent close prices so
// indicators are available before the live feed has produced enough ticks.
// The klines response goes through the cached fetcher (`history:{SYMBOL}`,
// hourly tier), so restarts within the hour do not hit the exchange again.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::fetcher::CachedFetcher;
use crate::cache::Tier;
use crate::market_data::PriceHistoryStore;
use crate::types::{now_ms, PriceSample};

/// Provider name the exchange REST base URL is registered under.
pub const SEED_PROVIDER: &str = "exchange-rest";
const SEED_INTERVAL: &str = "1h";

pub fn history_key(symbol: &str) -> String {
    format!("history:{symbol}")
}

pub fn klines_path(symbol: &str, interval: &str, limit: usize) -> String {
    format!("api/v3/klines?symbol={symbol}&interval={interval}&limit={limit}")
}

/// Parse a Binance klines array-of-arrays into close-price samples.
///
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
///
/// Short or unparsable rows are skipped, as is the still-open candle
/// (closeTime after `now`): its close time lies in the future and would
/// make the store reject live ticks until it passes.
pub fn parse_klines(symbol: &str, body: &Value, now: i64) -> Result<Vec<PriceSample>> {
    let rows = body.as_array().context("klines response is not an array")?;

    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(arr) = row.as_array().filter(|a| a.len() >= 7) else {
            warn!(symbol, "skipping malformed kline row");
            continue;
        };
        let close = match &arr[4] {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        let (Some(close), Some(close_time)) = (close, arr[6].as_i64()) else {
            warn!(symbol, "skipping kline row without close price/time");
            continue;
        };
        if close_time > now {
            debug!(symbol, close_time, "skipping open kline");
            continue;
        }
        if close.is_finite() && close > 0.0 {
            samples.push(PriceSample::new(symbol, close, close_time));
        }
    }
    Ok(samples)
}

/// Seed one symbol. Returns how many samples the store kept.
pub async fn seed_symbol(
    fetcher: &Arc<CachedFetcher>,
    store: &PriceHistoryStore,
    symbol: &str,
    limit: usize,
) -> Result<usize> {
    let lookup = fetcher
        .fetch(
            &history_key(symbol),
            SEED_PROVIDER,
            &klines_path(symbol, SEED_INTERVAL, limit),
            Tier::Hourly,
        )
        .await
        .with_context(|| format!("failed to fetch seed klines for {symbol}"))?;

    let Some(body) = lookup.value else {
        return Ok(0);
    };
    let samples = parse_klines(symbol, &body, now_ms())?;
    Ok(store.seed(symbol, samples))
}

/// Seed every symbol; failures are logged and skipped.
pub async fn seed_all(fetcher: &Arc<CachedFetcher>, store: &PriceHistoryStore, symbols: &[String]) -> usize {
    let mut total = 0;
    for symbol in symbols {
        match seed_symbol(fetcher, store, symbol, store.capacity()).await {
            Ok(n) => {
                info!(symbol = %symbol, seeded = n, "price history seeded");
                total += n;
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "seeding failed, waiting for live ticks"),
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cache::{TierTable, TieredCache};
    use crate::error::UpstreamError;
    use crate::upstream::client::UpstreamSource;
    use crate::upstream::rate_limit::{RateLimiter, RateLimiterConfig};

    struct KlinesSource(HashMap<String, Value>);

    #[async_trait]
    impl UpstreamSource for KlinesSource {
        async fn fetch(&self, provider: &str, path: &str) -> Result<Value, UpstreamError> {
            assert_eq!(provider, SEED_PROVIDER);
            self.0
                .iter()
                .find(|(sym, _)| path.contains(&format!("symbol={sym}&")))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| UpstreamError::Status {
                    provider: provider.into(),
                    status: 400,
                    body: "Invalid symbol.".into(),
                })
        }
    }

    fn kline(close_time: i64, close: &str) -> Value {
        json!([close_time - 3_599_999, "1", "2", "0.5", close, "10", close_time, "0", 1, "0", "0", "0"])
    }

    fn fetcher(source: KlinesSource) -> Arc<CachedFetcher> {
        Arc::new(CachedFetcher::new(
            Arc::new(TieredCache::new(TierTable::default())),
            Arc::new(RateLimiter::new(RateLimiterConfig {
                default_min_interval_ms: 0,
                ..RateLimiterConfig::default()
            })),
            Arc::new(source),
        ))
    }

    #[test]
    fn parses_close_prices_and_skips_junk() {
        let body = json!([kline(1_000, "10.5"), [1, 2], kline(2_000, "abc"), kline(3_000, "11")]);
        let samples = parse_klines("BTCUSDT", &body, 10_000).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], PriceSample::new("BTCUSDT", 10.5, 1_000));
        assert_eq!(samples[1].timestamp, 3_000);
        assert!(parse_klines("X", &json!({"code": -1121}), 10_000).is_err());
    }

    #[test]
    fn open_candle_is_dropped() {
        let body = json!([kline(1_000, "10"), kline(5_000, "11")]);
        let samples = parse_klines("BTCUSDT", &body, 4_999).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 1_000);
        assert_eq!(parse_klines("BTCUSDT", &body, 5_000).unwrap().len(), 2);
    }

    #[test]
    fn paths_and_keys() {
        assert_eq!(history_key("ETHUSDT"), "history:ETHUSDT");
        assert_eq!(
            klines_path("ETHUSDT", "1h", 250),
            "api/v3/klines?symbol=ETHUSDT&interval=1h&limit=250"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_store_and_caches_response() {
        let rows: Vec<Value> = (1..=30).map(|i| kline(i * 3_600_000, &format!("{}", 100 + i))).collect();
        let f = fetcher(KlinesSource(HashMap::from([("BTCUSDT".to_string(), Value::Array(rows))])));
        let store = PriceHistoryStore::new(250);

        let n = seed_all(&f, &store, &["BTCUSDT".to_string(), "NOPE".to_string()]).await;
        assert_eq!(n, 30);
        assert_eq!(store.len("BTCUSDT"), 30);
        assert_eq!(store.len("NOPE"), 0);
        assert!(f.cache().get(&history_key("BTCUSDT")).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        // reseeding over existing history adds nothing
        assert_eq!(seed_symbol(&f, &store, "BTCUSDT", 250).await.unwrap(), 0);
        assert_eq!(store.len("BTCUSDT"), 30);
    }

    #[tokio::test]
    async fn live_tick_after_seeding_is_accepted() {
        let now = now_ms();
        let hour = 3_600_000;
        let mut rows: Vec<Value> = (1..=5).map(|i| kline(now - (6 - i) * hour, "100")).collect();
        // current hour, closes 30 minutes from now
        rows.push(kline(now + hour / 2, "101"));
        let f = fetcher(KlinesSource(HashMap::from([("BTCUSDT".to_string(), Value::Array(rows))])));
        let store = PriceHistoryStore::new(250);

        assert_eq!(seed_symbol(&f, &store, "BTCUSDT", 250).await.unwrap(), 5);
        assert!(store.append("BTCUSDT", 102.0, now + 1_000));
        assert_eq!(store.len("BTCUSDT"), 6);
    }
}
