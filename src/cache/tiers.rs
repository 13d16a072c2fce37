// =============================================================================
// Cache tiers — named freshness policies
// =============================================================================
//
//   tier                    fresh     stale (primary)   fallback
//   realtime                30s       60s               2m
//   minute                  60s       2m                4m
//   hourly                  1h        2h                4h
//   daily                   24h       48h               4d
//   daily-conservative      2d        4d                8d
//   five-day-conservative   5d        10d               20d
//
// A primary entry is fresh inside `fresh`, stale-but-usable inside `stale`.
// The separately written fallback copy survives for `fallback`.
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Realtime,
    Minute,
    Hourly,
    Daily,
    DailyConservative,
    FiveDayConservative,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Realtime,
        Tier::Minute,
        Tier::Hourly,
        Tier::Daily,
        Tier::DailyConservative,
        Tier::FiveDayConservative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Realtime => "realtime",
            Tier::Minute => "minute",
            Tier::Hourly => "hourly",
            Tier::Daily => "daily",
            Tier::DailyConservative => "daily-conservative",
            Tier::FiveDayConservative => "five-day-conservative",
        }
    }

    fn default_fresh_secs(self) -> u64 {
        match self {
            Tier::Realtime => 30,
            Tier::Minute => 60,
            Tier::Hourly => 3_600,
            Tier::Daily => 86_400,
            Tier::DailyConservative => 2 * 86_400,
            Tier::FiveDayConservative => 5 * 86_400,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown cache tier: {s}"))
    }
}

/// Resolved TTLs of one tier. `fresh_ttl <= stale_ttl` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    pub fallback_ttl: Duration,
}

impl TierPolicy {
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration, fallback_ttl: Duration) -> Self {
        Self {
            fresh_ttl,
            stale_ttl: stale_ttl.max(fresh_ttl),
            fallback_ttl,
        }
    }

    fn from_fresh(fresh_ttl: Duration) -> Self {
        Self::new(fresh_ttl, fresh_ttl.saturating_mul(2), fresh_ttl.saturating_mul(4))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Per-tier override; unset fields derive from `fresh_secs` (2x / 4x).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierOverride {
    #[serde(default)]
    pub fresh_secs: Option<u64>,
    #[serde(default)]
    pub stale_secs: Option<u64>,
    #[serde(default)]
    pub fallback_secs: Option<u64>,
}

fn default_maintenance_interval_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default)]
    pub tiers: HashMap<Tier, TierOverride>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: default_maintenance_interval_secs(),
            tiers: HashMap::new(),
        }
    }
}

/// Lookup table from tier to its resolved policy.
#[derive(Debug, Clone)]
pub struct TierTable {
    policies: HashMap<Tier, TierPolicy>,
}

impl TierTable {
    pub fn from_config(config: &CacheConfig) -> Self {
        let policies = Tier::ALL
            .into_iter()
            .map(|tier| {
                let over = config.tiers.get(&tier).cloned().unwrap_or_default();
                let fresh = Duration::from_secs(over.fresh_secs.unwrap_or_else(|| tier.default_fresh_secs()));
                let base = TierPolicy::from_fresh(fresh);
                let policy = TierPolicy::new(
                    fresh,
                    over.stale_secs.map(Duration::from_secs).unwrap_or(base.stale_ttl),
                    over.fallback_secs.map(Duration::from_secs).unwrap_or(base.fallback_ttl),
                );
                (tier, policy)
            })
            .collect();
        Self { policies }
    }

    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.policies
            .get(&tier)
            .copied()
            .unwrap_or_else(|| TierPolicy::from_fresh(Duration::from_secs(tier.default_fresh_secs())))
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for tier in Tier::ALL {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert_eq!("Hourly".parse::<Tier>().unwrap(), Tier::Hourly);
        assert!("weekly".parse::<Tier>().is_err());
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&Tier::FiveDayConservative).unwrap();
        assert_eq!(json, "\"five-day-conservative\"");
    }

    #[test]
    fn defaults_scale_from_fresh_ttl() {
        let table = TierTable::default();
        let hourly = table.policy(Tier::Hourly);
        assert_eq!(hourly.fresh_ttl, Duration::from_secs(3_600));
        assert_eq!(hourly.stale_ttl, Duration::from_secs(7_200));
        assert_eq!(hourly.fallback_ttl, Duration::from_secs(14_400));
    }

    #[test]
    fn overrides_apply_and_keep_fresh_within_stale() {
        let mut config = CacheConfig::default();
        config.tiers.insert(
            Tier::Realtime,
            TierOverride {
                fresh_secs: Some(10),
                stale_secs: Some(5),
                fallback_secs: Some(100),
            },
        );
        let p = TierTable::from_config(&config).policy(Tier::Realtime);
        assert_eq!(p.fresh_ttl, Duration::from_secs(10));
        assert_eq!(p.stale_ttl, Duration::from_secs(10));
        assert_eq!(p.fallback_ttl, Duration::from_secs(100));
    }

    #[test]
    fn config_parses_tier_keys() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "tiers": { "daily-conservative": { "fresh_secs": 60 } } }"#).unwrap();
        assert_eq!(config.maintenance_interval_secs, 600);
        let p = TierTable::from_config(&config).policy(Tier::DailyConservative);
        assert_eq!(p.fallback_ttl, Duration::from_secs(240));
    }

    #[test]
    fn huge_fresh_ttl_saturates() {
        let mut config = CacheConfig::default();
        config.tiers.insert(
            Tier::Daily,
            TierOverride {
                fresh_secs: Some(u64::MAX),
                ..TierOverride::default()
            },
        );
        let p = TierTable::from_config(&config).policy(Tier::Daily);
        assert_eq!(p.fresh_ttl, Duration::from_secs(u64::MAX));
        assert_eq!(p.stale_ttl, Duration::MAX);
        assert_eq!(p.fallback_ttl, Duration::MAX);
    }
}
