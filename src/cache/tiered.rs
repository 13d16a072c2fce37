// =============================================================================
// Tiered Cache — fresh / stale / fallback reads over upstream data
// =============================================================================
//
// Two maps:
//   primary   key         -> entry { value, fresh_until, stale_until }
//   fallback  (tier, key) -> entry { value, expires_at }
//
// Entries are replaced whole (`Arc` swap under a short write lock) so a
// reader never sees a half-written entry. Maintenance finds expired keys under
// a read lock and removes them in a separate short write section.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tiers::{Tier, TierPolicy, TierTable};

/// Where a `get_with_fallback` answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Fresh,
    Stale,
    Fallback,
    Absent,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheLookup<V> {
    #[serde(rename = "data")]
    pub value: Option<V>,
    pub fresh: bool,
    pub source: CacheSource,
}

impl<V> CacheLookup<V> {
    fn absent() -> Self {
        Self {
            value: None,
            fresh: false,
            source: CacheSource::Absent,
        }
    }
}

/// Cap for deadlines whose TTL overflows `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug)]
struct PrimaryEntry<V> {
    value: V,
    tier: Tier,
    stored_at: Instant,
    fresh_until: Instant,
    stale_until: Instant,
}

#[derive(Debug)]
struct FallbackEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub fallback_entries: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub fallback_hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub primary_removed: usize,
    pub fallback_removed: usize,
}

pub struct TieredCache<V> {
    tiers: TierTable,
    primary: RwLock<HashMap<String, Arc<PrimaryEntry<V>>>>,
    fallback: RwLock<HashMap<(Tier, String), Arc<FallbackEntry<V>>>>,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    fallback_hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> TieredCache<V> {
    pub fn new(tiers: TierTable) -> Self {
        Self {
            tiers,
            primary: RwLock::new(HashMap::new()),
            fallback: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            fallback_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.tiers.policy(tier)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// The value only while it is fresh.
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.primary.read().get(key).cloned();
        match entry {
            Some(e) if Instant::now() < e.fresh_until => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(e.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Best available value: fresh primary, then stale primary, then the
    /// fallback copy written for `tier`.
    pub fn get_with_fallback(&self, key: &str, tier: Tier) -> CacheLookup<V> {
        let now = Instant::now();

        let primary = self.primary.read().get(key).cloned();
        if let Some(e) = primary {
            if now < e.fresh_until {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup {
                    value: Some(e.value.clone()),
                    fresh: true,
                    source: CacheSource::Fresh,
                };
            }
            if now < e.stale_until {
                self.stale_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, tier = %e.tier, age_ms = (now - e.stored_at).as_millis() as u64, "serving stale entry");
                return CacheLookup {
                    value: Some(e.value.clone()),
                    fresh: false,
                    source: CacheSource::Stale,
                };
            }
        }

        let fallback = self.fallback.read().get(&(tier, key.to_string())).cloned();
        if let Some(e) = fallback {
            if now < e.expires_at {
                self.fallback_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, %tier, "serving fallback entry");
                return CacheLookup {
                    value: Some(e.value.clone()),
                    fresh: false,
                    source: CacheSource::Fallback,
                };
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::absent()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn set(&self, key: &str, value: V, tier: Tier) {
        let policy = self.tiers.policy(tier);
        let now = Instant::now();
        let entry = Arc::new(PrimaryEntry {
            value,
            tier,
            stored_at: now,
            fresh_until: deadline(now, policy.fresh_ttl),
            stale_until: deadline(now, policy.stale_ttl),
        });
        self.primary.write().insert(key.to_string(), entry);
    }

    pub fn set_fallback(&self, key: &str, value: V, tier: Tier) {
        let policy = self.tiers.policy(tier);
        let entry = Arc::new(FallbackEntry {
            value,
            expires_at: deadline(Instant::now(), policy.fallback_ttl),
        });
        self.fallback.write().insert((tier, key.to_string()), entry);
    }

    /// `set` + `set_fallback` in the same tier.
    pub fn set_with_fallback(&self, key: &str, value: V, tier: Tier) {
        self.set(key, value.clone(), tier);
        self.set_fallback(key, value, tier);
    }

    pub fn set_realtime(&self, key: &str, value: V) {
        self.set_with_fallback(key, value, Tier::Realtime);
    }

    pub fn set_minute(&self, key: &str, value: V) {
        self.set_with_fallback(key, value, Tier::Minute);
    }

    pub fn set_hourly(&self, key: &str, value: V) {
        self.set_with_fallback(key, value, Tier::Hourly);
    }

    pub fn set_daily(&self, key: &str, value: V) {
        self.set_with_fallback(key, value, Tier::Daily);
    }

    pub fn set_daily_conservative(&self, key: &str, value: V) {
        self.set_with_fallback(key, value, Tier::DailyConservative);
    }

    pub fn set_five_day_conservative(&self, key: &str, value: V) {
        self.set_with_fallback(key, value, Tier::FiveDayConservative);
    }

    /// Remove the primary entry and every fallback copy of `key`. Returns
    /// whether anything was removed.
    pub fn del(&self, key: &str) -> bool {
        let primary = self.primary.write().remove(key).is_some();
        let mut fallback = self.fallback.write();
        let before = fallback.len();
        fallback.retain(|(_, k), _| k != key);
        primary || fallback.len() != before
    }

    pub fn flush(&self) {
        let primary = {
            let mut map = self.primary.write();
            let n = map.len();
            map.clear();
            n
        };
        let fallback = {
            let mut map = self.fallback.write();
            let n = map.len();
            map.clear();
            n
        };
        info!(primary, fallback, "cache flushed");
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop primary entries past their stale window and fallback copies past
    /// their retention.
    pub fn perform_maintenance(&self) -> MaintenanceReport {
        let now = Instant::now();

        let expired_primary: Vec<String> = self
            .primary
            .read()
            .iter()
            .filter(|(_, e)| now >= e.stale_until)
            .map(|(k, _)| k.clone())
            .collect();
        let expired_fallback: Vec<(Tier, String)> = self
            .fallback
            .read()
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();

        let mut report = MaintenanceReport::default();

        if !expired_primary.is_empty() {
            let mut map = self.primary.write();
            for key in &expired_primary {
                // re-check: the key may have been rewritten since the scan
                if map.get(key).is_some_and(|e| now >= e.stale_until) {
                    map.remove(key);
                    report.primary_removed += 1;
                }
            }
        }

        if !expired_fallback.is_empty() {
            let mut map = self.fallback.write();
            for key in &expired_fallback {
                if map.get(key).is_some_and(|e| now >= e.expires_at) {
                    map.remove(key);
                    report.fallback_removed += 1;
                }
            }
        }

        self.evicted.fetch_add(
            (report.primary_removed + report.fallback_removed) as u64,
            Ordering::Relaxed,
        );
        report
    }

    /// Run `perform_maintenance` every `interval` until `token` fires.
    pub fn spawn_maintenance(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.perform_maintenance();
                        info!(
                            primary_removed = report.primary_removed,
                            fallback_removed = report.fallback_removed,
                            "cache maintenance sweep"
                        );
                    }
                }
            }
            debug!("cache maintenance loop stopped");
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.primary.read().len(),
            fallback_entries: self.fallback.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
