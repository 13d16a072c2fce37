// =============================================================================
// Central Application State — pricewire
// =============================================================================
//
// Explicitly constructed container for every long-lived component. Nothing is
// a module-level global: tests build isolated instances with fake transports.
//
// Wiring:
//   feed tick -> PriceHistoryStore::push -> BroadcastHub::tick (prices)
//   timer     -> BroadcastHub::recompute_and_broadcast (indicators)
//   REST      -> CachedFetcher -> TieredCache / RateLimiter -> upstream
//
// Lifecycle: `new` -> `seed_history` -> `start_feeds` -> `spawn_background`
// -> ... -> `shutdown` (cancels loops, closes feeds without reconnecting).
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::hub::HubStats;
use crate::broadcast::{BroadcastHub, IndicatorStatus};
use crate::cache::{CacheStats, TierTable, TieredCache};
use crate::indicators::IndicatorEngine;
use crate::market_data::feed::FeedTransport;
use crate::market_data::{
    FeedConnectionManager, FeedStatus, PriceHistoryStore, ReconnectPolicy, TickHandler, WebSocketTransport,
};
use crate::runtime_config::RuntimeConfig;
use crate::types::Tick;
use crate::upstream::rate_limit::ProviderLimiterSnapshot;
use crate::upstream::{seed, CachedFetcher, HttpUpstream, RateLimiter, UpstreamSource};

// =============================================================================
// Status surface
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub feeds: FeedStatus,
    pub indicators: BTreeMap<String, IndicatorStatus>,
    pub broadcast: HubStats,
    pub cache: CacheStats,
    pub rate_limits: Vec<ProviderLimiterSnapshot>,
    pub refreshes_in_flight: usize,
    pub uptime_secs: u64,
    pub server_time: i64,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    pub config: RuntimeConfig,

    // ── Streaming path ──────────────────────────────────────────────────
    pub history: Arc<PriceHistoryStore>,
    pub hub: Arc<BroadcastHub>,
    pub feeds: Arc<FeedConnectionManager>,

    // ── Upstream / cache path ───────────────────────────────────────────
    pub cache: Arc<TieredCache<Value>>,
    pub limiter: Arc<RateLimiter>,
    pub fetcher: Arc<CachedFetcher>,

    /// Cancels the broadcast and maintenance loops.
    pub shutdown: CancellationToken,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Production wiring: tungstenite feeds and reqwest upstreams.
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        let upstream = HttpUpstream::new(config.providers.clone(), config.upstream_timeout())?;
        Ok(Self::with_components(
            config,
            Arc::new(WebSocketTransport),
            Arc::new(upstream),
        ))
    }

    pub fn with_components(
        config: RuntimeConfig,
        transport: Arc<dyn FeedTransport>,
        upstream: Arc<dyn UpstreamSource>,
    ) -> Self {
        let history = Arc::new(PriceHistoryStore::new(config.history_capacity));
        let hub = Arc::new(BroadcastHub::new(
            history.clone(),
            IndicatorEngine::new(config.indicators.clone()),
            config.subscriber_queue_capacity,
        ));
        let feeds = Arc::new(FeedConnectionManager::new(
            transport,
            ReconnectPolicy::new(config.reconnect.clone()),
            config.feed_idle_timeout(),
        ));

        let cache = Arc::new(TieredCache::new(TierTable::from_config(&config.cache)));
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
        let fetcher = Arc::new(CachedFetcher::new(cache.clone(), limiter.clone(), upstream));

        Self {
            config,
            history,
            hub,
            feeds,
            cache,
            limiter,
            fetcher,
            shutdown: CancellationToken::new(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Tick callback for every feed: append to history, then push the raw
    /// price to subscribers. Out-of-order or invalid ticks go nowhere.
    pub fn tick_handler(&self) -> TickHandler {
        let history = self.history.clone();
        let hub = self.hub.clone();
        Arc::new(move |tick: Tick| {
            if history.push(tick.sample()) {
                hub.tick(&tick);
            }
        })
    }

    /// Connect every configured feed. Returns how many were started.
    pub fn start_feeds(&self) -> usize {
        let handler = self.tick_handler();
        let feeds = self.config.resolved_feeds();
        for feed in &feeds {
            self.feeds.connect(&feed.name, &feed.endpoint, handler.clone());
        }
        info!(count = feeds.len(), "feeds started");
        feeds.len()
    }

    /// Cold-start history from cached/REST klines.
    pub async fn seed_history(&self) -> usize {
        seed::seed_all(&self.fetcher, &self.history, &self.config.symbols).await
    }

    /// Start the indicator broadcast and cache maintenance loops.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.hub
                .clone()
                .run(self.config.broadcast_interval(), self.shutdown.child_token()),
            self.cache
                .clone()
                .spawn_maintenance(self.config.maintenance_interval(), self.shutdown.child_token()),
        ]
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.feeds.close_all().await;
        info!("components stopped");
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            feeds: self.feeds.status(),
            indicators: self.hub.indicator_status(),
            broadcast: self.hub.stats(),
            cache: self.cache.stats(),
            rate_limits: self.limiter.snapshot(),
            refreshes_in_flight: self.fetcher.refreshes_in_flight(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use parking_lot::Mutex;

    use super::*;
    use crate::broadcast::Channel;
    use crate::error::{FeedError, UpstreamError};
    use crate::indicators::rsi::RsiZone;
    use crate::market_data::feed::{FeedFrame, FrameStream};
    use crate::runtime_config::FeedConfig;

    /// First dial replays `frames` and stays open; later dials hang.
    struct ReplayTransport {
        frames: Mutex<Option<Vec<String>>>,
    }

    #[async_trait]
    impl FeedTransport for ReplayTransport {
        async fn connect(&self, _endpoint: &str) -> Result<FrameStream, FeedError> {
            let frames = self.frames.lock().take().unwrap_or_default();
            let items = frames.into_iter().map(|f| Ok(FeedFrame::Text(f)));
            Ok(Box::pin(stream::iter(items).chain(stream::pending())))
        }
    }

    struct NoUpstream;

    #[async_trait]
    impl UpstreamSource for NoUpstream {
        async fn fetch(&self, provider: &str, _path: &str) -> Result<Value, UpstreamError> {
            Err(UpstreamError::Status {
                provider: provider.to_string(),
                status: 503,
                body: String::new(),
            })
        }
    }

    fn state_with_ticks(frames: Vec<String>) -> AppState {
        let mut config = RuntimeConfig::default();
        config.symbols = vec!["BTCUSD".into()];
        config.feeds = vec![FeedConfig {
            name: "exchange-ticker".into(),
            endpoint: "wss://feed.invalid/ws".into(),
        }];
        AppState::with_components(
            config,
            Arc::new(ReplayTransport {
                frames: Mutex::new(Some(frames)),
            }),
            Arc::new(NoUpstream),
        )
    }

    fn btc_ticks() -> Vec<String> {
        (0..15)
            .map(|i| format!(r#"{{"symbol":"BTCUSD","price":{},"timestamp":{}}}"#, 100 + i, 1_000 + i))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fifteen_rising_ticks_make_rsi_available_and_high() {
        let state = state_with_ticks(btc_ticks());
        let (client, mut rx) = state.hub.register_subscriber(Channel::Prices);
        state.hub.handle_message(client, r#"{"type":"subscribe","symbols":["BTCUSD"]}"#);

        assert_eq!(state.start_feeds(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(state.history.len("BTCUSD"), 15);
        let snapshot = state.hub.current_snapshot("BTCUSD").expect("enough samples");
        let rsi = snapshot.rsi_for(14).expect("rsi(14) computed");
        assert_ne!(rsi.status, RsiZone::Unavailable);
        assert!(rsi.value.unwrap() > 50.0);
        assert_eq!(rsi.status, RsiZone::Overbought);

        // confirmation + one price_update per tick
        let mut updates = 0;
        while let Ok(text) = rx.try_recv() {
            if text.contains("price_update") {
                updates += 1;
            }
        }
        assert_eq!(updates, 15);

        let status = state.status();
        assert!(status.feeds.connected);
        assert_eq!(status.feeds.active_connections, vec!["exchange-ticker".to_string()]);
        let btc = &status.indicators["BTCUSD"];
        assert!(btc.available);
        assert_eq!(btc.sample_count, 15);
        assert_eq!(btc.last_update_timestamp, Some(1_014));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_feeds_and_loops() {
        let state = state_with_ticks(Vec::new());
        state.start_feeds();
        let handles = state.spawn_background();
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.shutdown().await;
        for h in handles {
            h.await.unwrap();
        }
        assert!(!state.status().feeds.connected);
        assert!(state.feeds.connection("exchange-ticker").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_seeding_leaves_history_empty() {
        let state = state_with_ticks(Vec::new());
        assert_eq!(state.seed_history().await, 0);
        assert_eq!(state.history.len("BTCUSD"), 0);
        assert!(state.status().rate_limits.iter().any(|l| l.failures == 1));
    }

    #[test]
    fn tick_handler_ignores_out_of_order_ticks() {
        let state = state_with_ticks(Vec::new());
        let (client, mut rx) = state.hub.register_subscriber(Channel::Prices);
        state.hub.update_subscription(client, ["X".to_string()].into(), Default::default());

        let handler = state.tick_handler();
        let tick = |price: f64, timestamp: i64| Tick {
            symbol: "X".into(),
            price,
            change_24h: None,
            volume_24h: None,
            timestamp,
        };
        handler(tick(1.0, 10));
        handler(tick(2.0, 5));
        handler(tick(3.0, 11));

        assert_eq!(state.history.prices("X"), vec![1.0, 3.0]);
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        assert_eq!(n, 2);
        assert_eq!(state.feeds.status().connections.len(), 0);
    }
}
