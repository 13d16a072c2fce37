// =============================================================================
// Runtime Configuration — JSON file with serde defaults + env overrides
// =============================================================================
//
// Every field carries a serde default so a partial (or empty) file is valid
// and adding fields never breaks an older config. Resolution order:
//
//   built-in defaults  <  pricewire.json (or $PRICEWIRE_CONFIG)  <  env vars
//
// Env overrides: PRICEWIRE_SYMBOLS (comma list), PRICEWIRE_BIND_ADDR.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CacheConfig;
use crate::indicators::IndicatorParams;
use crate::market_data::feed::build_ticker_url;
use crate::market_data::ReconnectConfig;
use crate::upstream::seed::SEED_PROVIDER;
use crate::upstream::RateLimiterConfig;

pub const DEFAULT_CONFIG_PATH: &str = "pricewire.json";
pub const DEFAULT_FEED_NAME: &str = "exchange-ticker";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_feed_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_history_capacity() -> usize {
    250
}

fn default_feed_idle_timeout_secs() -> u64 {
    60
}

fn default_broadcast_interval_secs() -> u64 {
    300
}

fn default_subscriber_queue_capacity() -> usize {
    256
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

fn default_providers() -> HashMap<String, String> {
    HashMap::from([(SEED_PROVIDER.to_string(), "https://api.binance.com".to_string())])
}

/// One named upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub endpoint: String,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Symbols & feeds -----------------------------------------------------

    /// Symbols whose prices are tracked.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Explicit feeds. When empty, one `exchange-ticker` feed on
    /// `feed_base_url` carries the ticker of every symbol.
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,

    #[serde(default = "default_feed_base_url")]
    pub feed_base_url: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// A feed silent for this long is treated as dead.
    #[serde(default = "default_feed_idle_timeout_secs")]
    pub feed_idle_timeout_secs: u64,

    // --- History & indicators ----------------------------------------------

    /// Samples kept per symbol.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub indicators: IndicatorParams,

    /// Fill history from exchange klines before the feed starts.
    #[serde(default = "default_true")]
    pub seed_on_start: bool,

    // --- Broadcast -----------------------------------------------------------

    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,

    /// Outbound messages buffered per client before drops start.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    // --- Upstream providers & cache -----------------------------------------

    /// Provider name -> base URL.
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, String>,

    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    // --- Server --------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            feeds: Vec::new(),
            feed_base_url: default_feed_base_url(),
            reconnect: ReconnectConfig::default(),
            feed_idle_timeout_secs: default_feed_idle_timeout_secs(),
            history_capacity: default_history_capacity(),
            indicators: IndicatorParams::default(),
            seed_on_start: true,
            broadcast_interval_secs: default_broadcast_interval_secs(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            providers: default_providers(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            rate_limiter: RateLimiterConfig::default(),
            cache: CacheConfig::default(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        config.normalize();

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            feeds = config.feeds.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// `$PRICEWIRE_CONFIG` (or `pricewire.json`), falling back to defaults
    /// with a warning, then env overrides.
    pub fn from_env() -> Self {
        let path = std::env::var("PRICEWIRE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        });
        config.apply_overrides(
            std::env::var("PRICEWIRE_SYMBOLS").ok(),
            std::env::var("PRICEWIRE_BIND_ADDR").ok(),
        );
        config
    }

    pub fn apply_overrides(&mut self, symbols: Option<String>, bind_addr: Option<String>) {
        if let Some(syms) = symbols {
            self.symbols = syms.split(',').map(str::to_string).collect();
        }
        if let Some(addr) = bind_addr.filter(|a| !a.trim().is_empty()) {
            self.bind_addr = addr.trim().to_string();
        }
        self.normalize();
    }

    /// Uppercase, dedupe, and never leave the symbol list empty.
    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.symbols = self
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        if self.symbols.is_empty() {
            self.symbols = default_symbols();
        }
    }

    /// Configured feeds, or the default combined ticker feed.
    pub fn resolved_feeds(&self) -> Vec<FeedConfig> {
        if !self.feeds.is_empty() {
            return self.feeds.clone();
        }
        vec![FeedConfig {
            name: DEFAULT_FEED_NAME.to_string(),
            endpoint: build_ticker_url(&self.feed_base_url, &self.symbols),
        }]
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1))
    }

    pub fn feed_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_idle_timeout_secs.max(1))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.cache.maintenance_interval_secs.max(1))
    }
}
