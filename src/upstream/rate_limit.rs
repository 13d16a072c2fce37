// =============================================================================
// Rate Limiter — per-provider spacing with backoff on throttling
// =============================================================================
//
// Upstream providers enforce hard quotas. Every call to a provider goes
// through `schedule`, which:
//   - waits until `min_interval` has passed since the previous call to that
//     provider started (process-wide, shared by all callers),
//   - retries throttling errors (429 / connection reset) with
//     `base * 2^attempt` backoff, raised to the server's Retry-After,
//   - propagates every other error immediately.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::UpstreamError;

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_min_interval_ms")]
    pub default_min_interval_ms: u64,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// provider name -> min interval (ms)
    #[serde(default)]
    pub providers: HashMap<String, u64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_min_interval_ms: default_min_interval_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_retries: default_max_retries(),
            providers: HashMap::new(),
        }
    }
}

/// Spacing state of one provider.
struct ProviderGate {
    min_interval: Duration,
    /// Held across the spacing wait so callers queue in order.
    last_request_at: Mutex<Option<Instant>>,
    calls: AtomicU64,
    throttled: AtomicU64,
    failures: AtomicU64,
}

impl ProviderGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: Mutex::new(None),
            calls: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    async fn wait_turn(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLimiterSnapshot {
    pub provider: String,
    pub min_interval_ms: u64,
    pub calls: u64,
    pub throttled_retries: u64,
    pub failures: u64,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    gates: RwLock<HashMap<String, Arc<ProviderGate>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            gates: RwLock::new(HashMap::new()),
        }
    }

    fn gate(&self, provider: &str) -> Arc<ProviderGate> {
        if let Some(gate) = self.gates.read().get(provider) {
            return gate.clone();
        }
        let min_interval_ms = self
            .config
            .providers
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_min_interval_ms);
        self.gates
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderGate::new(Duration::from_millis(min_interval_ms))))
            .clone()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.config.base_backoff_ms.saturating_mul(factor))
    }

    /// Run `call` against `provider` under its spacing gate, retrying
    /// throttling errors up to `max_retries` times.
    pub async fn schedule<T, F, Fut>(&self, provider: &str, mut call: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let gate = self.gate(provider);
        let mut attempt: u32 = 0;

        loop {
            gate.wait_turn().await;

            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_throttling() {
                gate.failures.fetch_add(1, Ordering::Relaxed);
                debug!(provider, error = %err, "upstream call failed without retry");
                return Err(err);
            }

            if attempt >= self.config.max_retries {
                gate.failures.fetch_add(1, Ordering::Relaxed);
                warn!(provider, attempts = attempt + 1, error = %err, "throttling retries exhausted");
                return Err(err);
            }

            let delay = self.backoff(attempt).max(err.retry_after().unwrap_or_default());
            gate.throttled.fetch_add(1, Ordering::Relaxed);
            warn!(
                provider,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "upstream throttled, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<ProviderLimiterSnapshot> {
        let gates = self.gates.read();
        let mut out: Vec<ProviderLimiterSnapshot> = gates
            .iter()
            .map(|(name, g)| ProviderLimiterSnapshot {
                provider: name.clone(),
                min_interval_ms: g.min_interval.as_millis() as u64,
                calls: g.calls.load(Ordering::Relaxed),
                throttled_retries: g.throttled.load(Ordering::Relaxed),
                failures: g.failures.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("providers", &self.gates.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures_util::future::join_all;

    use super::*;

    fn limiter(min_interval_ms: u64, max_retries: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            default_min_interval_ms: min_interval_ms,
            base_backoff_ms: 1_000,
            max_retries,
            providers: HashMap::from([("fast".to_string(), 10)]),
        })
    }

    fn throttled(retry_after: Option<Duration>) -> UpstreamError {
        UpstreamError::Throttled {
            provider: "etf".into(),
            retry_after,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_are_spaced_by_min_interval() {
        let limiter = limiter(500, 0);
        let starts = parking_lot::Mutex::new(Vec::new());

        let calls = (0..6).map(|i| {
            let limiter = &limiter;
            let starts = &starts;
            async move {
                limiter
                    .schedule("etf", || async {
                        starts.lock().push(Instant::now());
                        Ok::<_, UpstreamError>(i)
                    })
                    .await
            }
        });
        let results = join_all(calls).await;
        assert!(results.iter().all(Result::is_ok));

        let mut starts = starts.into_inner();
        starts.sort();
        assert_eq!(starts.len(), 6);
        for w in starts.windows(2) {
            assert!(w[1] - w[0] >= Duration::from_millis(500), "{:?}", w[1] - w[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn providers_are_gated_independently() {
        let limiter = limiter(10_000, 0);
        let t0 = Instant::now();
        limiter.schedule("a", || async { Ok::<_, UpstreamError>(()) }).await.unwrap();
        limiter.schedule("b", || async { Ok::<_, UpstreamError>(()) }).await.unwrap();
        assert!(Instant::now() - t0 < Duration::from_millis(1));

        limiter.schedule("fast", || async { Ok::<_, UpstreamError>(()) }).await.unwrap();
        limiter.schedule("fast", || async { Ok::<_, UpstreamError>(()) }).await.unwrap();
        assert!(Instant::now() - t0 <= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_retries_with_exponential_backoff() {
        let limiter = limiter(0, 3);
        let times = parking_lot::Mutex::new(Vec::new());
        let n = AtomicU32::new(0);

        let out = limiter
            .schedule("etf", || async {
                times.lock().push(Instant::now());
                if n.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(throttled(None))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(out.unwrap(), 42);
        let times = times.into_inner();
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - times[0], Duration::from_millis(1_000));
        assert_eq!(times[2] - times[1], Duration::from_millis(2_000));

        let snap = limiter.snapshot();
        assert_eq!(snap[0].throttled_retries, 2);
        assert_eq!(snap[0].calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_raises_backoff() {
        let limiter = limiter(0, 1);
        let times = parking_lot::Mutex::new(Vec::new());
        let n = AtomicU32::new(0);

        limiter
            .schedule("etf", || async {
                times.lock().push(Instant::now());
                if n.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(throttled(Some(Duration::from_secs(7))))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let times = times.into_inner();
        assert_eq!(times[1] - times[0], Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_ceiling() {
        let limiter = limiter(0, 2);
        let n = AtomicU32::new(0);
        let out: Result<(), _> = limiter
            .schedule("etf", || async {
                n.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::ConnectionReset {
                    provider: "etf".into(),
                    message: "reset".into(),
                })
            })
            .await;

        assert!(matches!(out, Err(UpstreamError::ConnectionReset { .. })));
        assert_eq!(n.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.snapshot()[0].failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_throttling_errors_propagate_immediately() {
        let limiter = limiter(0, 5);
        let n = AtomicU32::new(0);
        let out: Result<(), _> = limiter
            .schedule("etf", || async {
                n.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Status {
                    provider: "etf".into(),
                    status: 500,
                    body: "boom".into(),
                })
            })
            .await;

        assert!(matches!(out, Err(UpstreamError::Status { status: 500, .. })));
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }
}
