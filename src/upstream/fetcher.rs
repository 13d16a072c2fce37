// =============================================================================
// Cached Fetcher — cache-first reads with rate-limited fills
// =============================================================================
//
//   fresh     -> serve
//   stale     -> serve, refresh in the background
//   fallback  -> serve, refresh in the background
//   absent    -> rate-limited upstream call, then set + set_fallback
//
// At most one background refresh runs per key. Concurrent misses on the same
// key share a single cold fill and all see its result. A failed synchronous
// fill is returned to the caller only when there is nothing cached to fall
// back on.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::client::UpstreamSource;
use super::rate_limit::RateLimiter;
use crate::cache::{CacheLookup, CacheSource, Tier, TieredCache};
use crate::error::UpstreamError;

type SharedFill = Shared<BoxFuture<'static, Result<Value, UpstreamError>>>;

pub struct CachedFetcher {
    cache: Arc<TieredCache<Value>>,
    limiter: Arc<RateLimiter>,
    source: Arc<dyn UpstreamSource>,
    in_flight: Mutex<HashSet<String>>,
    cold_fills: Mutex<HashMap<String, SharedFill>>,
}

impl CachedFetcher {
    pub fn new(
        cache: Arc<TieredCache<Value>>,
        limiter: Arc<RateLimiter>,
        source: Arc<dyn UpstreamSource>,
    ) -> Self {
        Self {
            cache,
            limiter,
            source,
            in_flight: Mutex::new(HashSet::new()),
            cold_fills: Mutex::new(HashMap::new()),
        }
    }

    /// Best available value for `key`, filling from `provider/path` when
    /// nothing usable is cached.
    pub async fn fetch(
        self: &Arc<Self>,
        key: &str,
        provider: &str,
        path: &str,
        tier: Tier,
    ) -> Result<CacheLookup<Value>, UpstreamError> {
        let cached = self.cache.get_with_fallback(key, tier);

        match cached.source {
            CacheSource::Fresh => Ok(cached),
            CacheSource::Stale | CacheSource::Fallback => {
                self.spawn_refresh(key, provider, path, tier);
                Ok(cached)
            }
            CacheSource::Absent => {
                let value = self.cold_fill(key, provider, path, tier).await?;
                Ok(CacheLookup {
                    value: Some(value),
                    fresh: true,
                    source: CacheSource::Fresh,
                })
            }
        }
    }

    /// Rate-limited upstream call; on success the value is stored as both
    /// primary and fallback in `tier`.
    pub async fn fill(&self, key: &str, provider: &str, path: &str, tier: Tier) -> Result<Value, UpstreamError> {
        let source = &self.source;
        let value = self
            .limiter
            .schedule(provider, || source.fetch(provider, path))
            .await?;
        self.cache.set_with_fallback(key, value.clone(), tier);
        debug!(key, provider, %tier, "cache filled from upstream");
        Ok(value)
    }

    /// Fill for a miss. Callers arriving while a fill for `key` is running
    /// await that fill instead of starting their own.
    async fn cold_fill(
        self: &Arc<Self>,
        key: &str,
        provider: &str,
        path: &str,
        tier: Tier,
    ) -> Result<Value, UpstreamError> {
        let fill = {
            let mut fills = self.cold_fills.lock();
            match fills.get(key) {
                Some(running) => {
                    debug!(key, "joining in-flight fill");
                    running.clone()
                }
                None => {
                    // the previous fill may have landed between our miss and the lock
                    if let Some(value) = self.cache.get(key) {
                        return Ok(value);
                    }
                    let this = self.clone();
                    let (k, provider, path) = (key.to_string(), provider.to_string(), path.to_string());
                    let fill = async move {
                        let result = this.fill(&k, &provider, &path, tier).await;
                        this.cold_fills.lock().remove(&k);
                        result
                    }
                    .boxed()
                    .shared();
                    fills.insert(key.to_string(), fill.clone());
                    fill
                }
            }
        };
        fill.await
    }

    /// Start a background refresh unless one is already running for `key`.
    /// Returns whether a refresh was started.
    pub fn spawn_refresh(self: &Arc<Self>, key: &str, provider: &str, path: &str, tier: Tier) -> bool {
        if !self.in_flight.lock().insert(key.to_string()) {
            debug!(key, "refresh already in flight");
            return false;
        }

        let this = self.clone();
        let (key, provider, path) = (key.to_string(), provider.to_string(), path.to_string());
        tokio::spawn(async move {
            if let Err(e) = this.fill(&key, &provider, &path, tier).await {
                warn!(key = %key, provider = %provider, error = %e, "background refresh failed, keeping cached value");
            }
            this.in_flight.lock().remove(&key);
        });
        true
    }

    pub fn refreshes_in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn cache(&self) -> &Arc<TieredCache<Value>> {
        &self.cache
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::future::join_all;
    use serde_json::json;
    use tokio::time::advance;

    use super::*;
    use crate::cache::tiers::{CacheConfig, TierOverride, TierTable};
    use crate::upstream::rate_limit::RateLimiterConfig;

    /// Answers `{"n": call_number}` after `latency`, or fails when `fail` is set.
    struct FakeSource {
        calls: AtomicU32,
        latency: Duration,
        fail: parking_lot::Mutex<Option<UpstreamError>>,
    }

    impl FakeSource {
        fn new(latency: Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                latency,
                fail: parking_lot::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl UpstreamSource for FakeSource {
        async fn fetch(&self, _provider: &str, _path: &str) -> Result<Value, UpstreamError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.latency).await;
            if let Some(e) = self.fail.lock().clone() {
                return Err(e);
            }
            Ok(json!({ "n": n }))
        }
    }

    /// hourly: fresh 10s, stale 20s, fallback 40s
    fn fetcher(source: Arc<FakeSource>) -> Arc<CachedFetcher> {
        let mut config = CacheConfig::default();
        config.tiers.insert(
            Tier::Hourly,
            TierOverride {
                fresh_secs: Some(10),
                ..TierOverride::default()
            },
        );
        let cache = Arc::new(TieredCache::new(TierTable::from_config(&config)));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            default_min_interval_ms: 0,
            max_retries: 0,
            ..RateLimiterConfig::default()
        }));
        Arc::new(CachedFetcher::new(cache, limiter, source))
    }

    #[tokio::test(start_paused = true)]
    async fn miss_fills_then_serves_fresh() {
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let f = fetcher(source.clone());

        let first = f.fetch("etf:flows", "etf", "flows", Tier::Hourly).await.unwrap();
        assert_eq!(first.source, CacheSource::Fresh);
        assert_eq!(first.value, Some(json!({ "n": 1 })));

        let second = f.fetch("etf:flows", "etf", "flows", Tier::Hourly).await.unwrap();
        assert_eq!(second.value, Some(json!({ "n": 1 })));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_is_served_and_refreshed_once() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(100)));
        let f = fetcher(source.clone());
        f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();

        advance(Duration::from_secs(11)).await;
        let a = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();
        let b = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();
        assert_eq!(a.source, CacheSource::Stale);
        assert_eq!(b.source, CacheSource::Stale);
        assert_eq!(a.value, Some(json!({ "n": 1 })));
        assert_eq!(f.refreshes_in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.refreshes_in_flight(), 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let c = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();
        assert_eq!(c.source, CacheSource::Fresh);
        assert_eq!(c.value, Some(json!({ "n": 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_fallback() {
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let f = fetcher(source.clone());
        f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();

        *source.fail.lock() = Some(UpstreamError::Status {
            provider: "etf".into(),
            status: 503,
            body: String::new(),
        });
        advance(Duration::from_secs(25)).await;

        let hit = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();
        assert_eq!(hit.source, CacheSource::Fallback);
        assert_eq!(hit.value, Some(json!({ "n": 1 })));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let hit = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();
        assert_eq!(hit.source, CacheSource::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fill() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(100)));
        let f = fetcher(source.clone());

        let results = join_all((0..5).map(|_| f.fetch("k", "etf", "p", Tier::Hourly))).await;
        for r in results {
            let r = r.unwrap();
            assert_eq!(r.source, CacheSource::Fresh);
            assert_eq!(r.value, Some(json!({ "n": 1 })));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(f.cold_fills.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_failure() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(100)));
        *source.fail.lock() = Some(UpstreamError::Timeout(Duration::from_secs(10)));
        let f = fetcher(source.clone());

        let results = join_all((0..3).map(|_| f.fetch("k", "etf", "p", Tier::Hourly))).await;
        assert!(results.iter().all(|r| matches!(r, Err(UpstreamError::Timeout(_)))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // the next miss tries again
        *source.fail.lock() = None;
        let hit = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap();
        assert_eq!(hit.value, Some(json!({ "n": 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn miss_with_failing_upstream_is_an_error() {
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        *source.fail.lock() = Some(UpstreamError::Timeout(Duration::from_secs(10)));
        let f = fetcher(source);

        let err = f.fetch("k", "etf", "p", Tier::Hourly).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout(_)));
        assert_eq!(f.cache().stats().entries, 0);
    }
}
