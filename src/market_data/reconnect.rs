// =============================================================================
// Reconnect Policy — jittered exponential backoff with a hard ceiling
// =============================================================================
//
//   delay(n) = min(cap, base * 2^n + U[0, jitter))
//
// After `max_attempts` consecutive failures the feed gives up (fail-stop) and
// waits for an explicit reconnect.
// =============================================================================

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to every delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Consecutive failures tolerated before the feed is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Stateless delay calculator; the attempt counter lives on the connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another reconnect may be scheduled after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.config.max_attempts
    }

    /// Delay before reconnect number `attempts + 1`, or `None` once the
    /// ceiling is reached.
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if !self.should_retry(attempts) {
            return None;
        }

        let jitter = if self.config.jitter_ms > 0 {
            rand::rng().random_range(0..self.config.jitter_ms)
        } else {
            0
        };
        let backoff = self
            .config
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl(attempts).unwrap_or(u64::MAX));
        let millis = backoff
            .saturating_add(jitter)
            .min(self.config.max_delay_ms);

        Some(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter_ms,
            max_attempts,
        })
    }

    #[test]
    fn doubles_until_capped() {
        let p = policy(0, 10);
        let delays: Vec<u64> = (0..7)
            .map(|n| p.delay_for(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_600, 2_000, 2_000]);
    }

    #[test]
    fn sequence_is_non_decreasing_with_jitter() {
        // jitter below base keeps consecutive delays ordered
        let p = policy(99, 10);
        for _ in 0..50 {
            let delays: Vec<Duration> = (0..10).map(|n| p.delay_for(n).unwrap()).collect();
            for w in delays.windows(2) {
                assert!(w[1] >= w[0], "{:?} then {:?}", w[0], w[1]);
            }
            assert!(delays.iter().all(|d| *d <= Duration::from_millis(2_000)));
        }
    }

    #[test]
    fn stops_at_ceiling() {
        let p = policy(0, 3);
        assert!(p.delay_for(0).is_some());
        assert!(p.delay_for(2).is_some());
        assert!(p.delay_for(3).is_none());
        assert!(!p.should_retry(3));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let p = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: u32::MAX,
            ..ReconnectConfig::default()
        });
        assert_eq!(p.delay_for(200).unwrap(), Duration::from_millis(30_000));
    }
}
