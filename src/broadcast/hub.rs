// =============================================================================
// Broadcast Hub — subscriber registry and filtered fan-out
// =============================================================================
//
// Every connected client owns a bounded outbound queue drained by its socket
// task. The hub only ever `try_send`s into those queues, so one slow client
// cannot stall ticks or snapshots for anyone else:
//
//   queue full    -> message dropped for that client (warn)
//   queue closed  -> client is gone, removed from the registry immediately
//
// Price ticks are pushed as they arrive to price-channel subscribers of the
// symbol. Indicator snapshots are recomputed on a timer for every symbol with
// at least one indicator-channel subscriber and enough history, and each
// subscriber receives only the families it asked for.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{Channel, ClientMessage, ServerMessage};
use crate::indicators::{IndicatorEngine, IndicatorFamily, IndicatorSnapshot};
use crate::market_data::PriceHistoryStore;
use crate::types::Tick;

pub type SubscriberId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Connected,
    Subscribed,
}

struct Subscriber {
    channel: Channel,
    symbols: HashSet<String>,
    indicators: HashSet<IndicatorFamily>,
    tx: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Subscriber {
    fn state(&self) -> SubscriberState {
        if self.symbols.is_empty() {
            SubscriberState::Connected
        } else {
            SubscriberState::Subscribed
        }
    }

    fn sorted_symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.symbols.iter().cloned().collect();
        v.sort();
        v
    }

    fn sorted_indicators(&self) -> Vec<IndicatorFamily> {
        IndicatorFamily::ALL
            .into_iter()
            .filter(|f| self.indicators.contains(f))
            .collect()
    }
}

/// Read-only view of one subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: SubscriberId,
    pub channel: Channel,
    pub state: SubscriberState,
    pub symbols: Vec<String>,
    pub indicators: Vec<IndicatorFamily>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Per-symbol indicator availability for the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorStatus {
    pub available: bool,
    pub last_update_timestamp: Option<i64>,
    pub sample_count: usize,
    pub last_computed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub price_subscribers: usize,
    pub indicator_subscribers: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers_removed: u64,
}

/// Removes a symbol from the in-flight recompute set when dropped.
struct RecomputeGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    symbol: String,
}

impl Drop for RecomputeGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.symbol);
    }
}

pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    store: Arc<PriceHistoryStore>,
    engine: IndicatorEngine,
    latest: RwLock<HashMap<String, Arc<IndicatorSnapshot>>>,
    recomputing: Mutex<HashSet<String>>,
    queue_capacity: usize,
    sent: AtomicU64,
    dropped: AtomicU64,
    removed: AtomicU64,
}

impl BroadcastHub {
    pub fn new(store: Arc<PriceHistoryStore>, engine: IndicatorEngine, queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            store,
            engine,
            latest: RwLock::new(HashMap::new()),
            recomputing: Mutex::new(HashSet::new()),
            queue_capacity: queue_capacity.max(1),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &IndicatorEngine {
        &self.engine
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Add a subscriber; the caller drains the returned receiver into its
    /// socket.
    pub fn register_subscriber(&self, channel: Channel) -> (SubscriberId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.subscribers.write().insert(
            id,
            Subscriber {
                channel,
                symbols: HashSet::new(),
                indicators: HashSet::new(),
                tx,
                connected_at: now,
                last_activity: now,
            },
        );
        info!(client = %id, ?channel, "subscriber registered");
        (id, rx)
    }

    pub fn unregister_subscriber(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            info!(client = %id, "subscriber unregistered");
        }
        removed
    }

    /// Replace a subscriber's interest sets. An empty `indicators` set means
    /// every family. Returns `false` for an unknown subscriber.
    pub fn update_subscription(
        &self,
        id: SubscriberId,
        symbols: HashSet<String>,
        indicators: HashSet<IndicatorFamily>,
    ) -> bool {
        let mut subs = self.subscribers.write();
        let Some(sub) = subs.get_mut(&id) else {
            return false;
        };
        sub.symbols = symbols.iter().map(|s| normalize_symbol(s)).collect();
        sub.indicators = if indicators.is_empty() {
            IndicatorFamily::all()
        } else {
            indicators
        };
        sub.last_activity = Utc::now();
        debug!(client = %id, symbols = ?sub.sorted_symbols(), state = ?sub.state(), "subscription updated");
        true
    }

    pub fn subscription(&self, id: SubscriberId) -> Option<SubscriptionView> {
        self.subscribers.read().get(&id).map(|s| SubscriptionView {
            id,
            channel: s.channel,
            state: s.state(),
            symbols: s.sorted_symbols(),
            indicators: s.sorted_indicators(),
            connected_at: s.connected_at,
            last_activity: s.last_activity,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn touch(&self, id: SubscriberId) {
        if let Some(sub) = self.subscribers.write().get_mut(&id) {
            sub.last_activity = Utc::now();
        }
    }

    /// Queue one message for one subscriber.
    pub fn send_to(&self, id: SubscriberId, msg: &ServerMessage) -> bool {
        let tx = match self.subscribers.read().get(&id) {
            Some(sub) => sub.tx.clone(),
            None => return false,
        };
        self.deliver(vec![(id, tx, msg.to_json())]) == 1
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Push a raw price to every price-channel subscriber of its symbol.
    /// Returns how many subscribers it was queued for.
    pub fn tick(&self, tick: &Tick) -> usize {
        let targets: Vec<(SubscriberId, mpsc::Sender<String>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| s.channel == Channel::Prices && s.symbols.contains(&tick.symbol))
            .map(|(id, s)| (*id, s.tx.clone()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let text = ServerMessage::price_update(tick).to_json();
        self.deliver(targets.into_iter().map(|(id, tx)| (id, tx, text.clone())).collect())
    }

    /// Recompute and push snapshots for every symbol an indicator-channel
    /// subscriber is interested in. Returns the number of messages queued.
    pub fn recompute_and_broadcast(&self) -> usize {
        let symbols: HashSet<String> = self
            .subscribers
            .read()
            .values()
            .filter(|s| s.channel == Channel::Indicators)
            .flat_map(|s| s.symbols.iter().cloned())
            .collect();

        let mut delivered = 0;
        for symbol in symbols {
            delivered += self.recompute_symbol(&symbol);
        }
        delivered
    }

    /// Recompute one symbol and fan it out. At most one recompute per symbol
    /// runs at a time; a concurrent call returns 0.
    pub fn recompute_symbol(&self, symbol: &str) -> usize {
        if !self.recomputing.lock().insert(symbol.to_string()) {
            debug!(symbol, "recompute already in flight");
            return 0;
        }
        let _guard = RecomputeGuard {
            set: &self.recomputing,
            symbol: symbol.to_string(),
        };

        let Some(snapshot) = self.refresh_snapshot(symbol) else {
            return 0;
        };

        let targets: Vec<(SubscriberId, mpsc::Sender<String>, HashSet<IndicatorFamily>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| s.channel == Channel::Indicators && s.symbols.contains(symbol))
            .map(|(id, s)| (*id, s.tx.clone(), s.indicators.clone()))
            .collect();

        let all = IndicatorFamily::all();
        let outbound = targets
            .into_iter()
            .map(|(id, tx, families)| {
                let data = if families == all {
                    (*snapshot).clone()
                } else {
                    snapshot.filtered(&families)
                };
                (id, tx, ServerMessage::indicator_update(data).to_json())
            })
            .collect();

        let delivered = self.deliver(outbound);
        debug!(symbol, delivered, samples = snapshot.sample_count, "indicator snapshot broadcast");
        delivered
    }

    /// Compute a fresh snapshot from the current history and cache it.
    /// `None` below the engine's minimum sample count.
    fn refresh_snapshot(&self, symbol: &str) -> Option<Arc<IndicatorSnapshot>> {
        let samples = self.store.snapshot(symbol);
        if samples.len() < self.engine.min_samples() {
            debug!(symbol, samples = samples.len(), min = self.engine.min_samples(), "not enough history for indicators");
            return None;
        }
        let snapshot = Arc::new(self.engine.compute(symbol, &samples)?);
        self.latest.write().insert(symbol.to_string(), snapshot.clone());
        Some(snapshot)
    }

    /// Up-to-date snapshot for on-demand readers.
    pub fn current_snapshot(&self, symbol: &str) -> Option<Arc<IndicatorSnapshot>> {
        self.refresh_snapshot(&normalize_symbol(symbol))
    }

    /// `try_send` each message; drop on a full queue, remove the subscriber
    /// on a closed one. Never fails as a whole.
    fn deliver(&self, outbound: Vec<(SubscriberId, mpsc::Sender<String>, String)>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, tx, text) in outbound {
            match tx.try_send(text) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(client = %id, "subscriber queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write();
            for id in &dead {
                if subs.remove(id).is_some() {
                    self.removed.fetch_add(1, Ordering::Relaxed);
                    warn!(client = %id, "subscriber disconnected during fan-out, removed");
                }
            }
        }

        self.sent.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    // -------------------------------------------------------------------------
    // Client protocol
    // -------------------------------------------------------------------------

    /// Apply one client frame; replies are queued on the subscriber's own
    /// outbound queue.
    pub fn handle_message(&self, id: SubscriberId, text: &str) {
        self.touch(id);
        for reply in self.apply(id, ClientMessage::parse(text)) {
            if !self.send_to(id, &reply) {
                break;
            }
        }
    }

    fn apply(&self, id: SubscriberId, msg: ClientMessage) -> Vec<ServerMessage> {
        let Some(view) = self.subscription(id) else {
            return Vec::new();
        };

        match msg {
            ClientMessage::Ping => vec![ServerMessage::pong()],

            ClientMessage::Subscribe { symbols } => {
                let symbols = symbols.iter().map(|s| normalize_symbol(s)).collect();
                self.update_subscription(id, symbols, view.indicators.into_iter().collect());
                vec![self.confirmation(id)]
            }

            ClientMessage::SubscribeSymbol { symbol, indicators } => {
                let symbol = normalize_symbol(&symbol);
                let mut symbols: HashSet<String> = view.symbols.into_iter().collect();
                symbols.insert(symbol.clone());
                let families = indicators.map(|v| v.into_iter().collect()).unwrap_or_default();
                self.update_subscription(id, symbols, families);

                let mut replies = vec![self.confirmation(id)];
                replies.extend(self.current_for(id, &symbol).ok());
                replies
            }

            ClientMessage::Unsubscribe { symbols } => {
                self.remove_symbols(id, symbols, view);
                vec![self.confirmation(id)]
            }

            ClientMessage::UnsubscribeSymbol { symbol } => {
                self.remove_symbols(id, symbol.map(|s| vec![s]), view);
                vec![self.confirmation(id)]
            }

            ClientMessage::GetCurrentIndicators { symbol } => {
                let symbols = match symbol {
                    Some(s) => vec![normalize_symbol(&s)],
                    None => view.symbols,
                };
                if symbols.is_empty() {
                    return vec![ServerMessage::error("no symbol given and no active subscription")];
                }
                symbols
                    .iter()
                    .map(|s| self.current_for(id, s).unwrap_or_else(|e| e))
                    .collect()
            }

            ClientMessage::Unsupported { reason } => {
                debug!(client = %id, %reason, "unsupported client message");
                vec![ServerMessage::error(reason)]
            }
        }
    }

    fn remove_symbols(&self, id: SubscriberId, symbols: Option<Vec<String>>, view: SubscriptionView) {
        let remaining: HashSet<String> = match symbols {
            None => HashSet::new(),
            Some(drop) => {
                let drop: HashSet<String> = drop.iter().map(|s| normalize_symbol(s)).collect();
                view.symbols.into_iter().filter(|s| !drop.contains(s)).collect()
            }
        };
        let families = if remaining.is_empty() {
            HashSet::new()
        } else {
            view.indicators.into_iter().collect()
        };
        self.update_subscription(id, remaining, families);
    }

    fn confirmation(&self, id: SubscriberId) -> ServerMessage {
        let view = self.subscription(id);
        let (symbols, indicators) = match view {
            Some(v) if v.channel == Channel::Indicators && !v.symbols.is_empty() => (v.symbols, v.indicators),
            Some(v) => (v.symbols, Vec::new()),
            None => (Vec::new(), Vec::new()),
        };
        ServerMessage::SubscriptionConfirmed {
            symbols,
            indicators,
            timestamp: crate::types::now_ms(),
        }
    }

    /// Current snapshot for `symbol` filtered to the subscriber's families,
    /// or an error message explaining why none is available.
    fn current_for(&self, id: SubscriberId, symbol: &str) -> Result<ServerMessage, ServerMessage> {
        let families = self
            .subscription(id)
            .map(|v| v.indicators.into_iter().collect::<HashSet<_>>())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(IndicatorFamily::all);

        match self.current_snapshot(symbol) {
            Some(snapshot) => Ok(ServerMessage::indicator_update(snapshot.filtered(&families))),
            None => Err(ServerMessage::error(format!(
                "indicators unavailable for {symbol}: {} of {} samples",
                self.store.len(symbol),
                self.engine.min_samples()
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn indicator_status(&self) -> BTreeMap<String, IndicatorStatus> {
        let min = self.engine.min_samples();
        let latest = self.latest.read();
        self.store
            .symbols()
            .into_iter()
            .map(|symbol| {
                let stats = self.store.stats(&symbol);
                let status = IndicatorStatus {
                    available: stats.sample_count >= min,
                    last_update_timestamp: stats.last_update_timestamp,
                    sample_count: stats.sample_count,
                    last_computed_at: latest.get(&symbol).map(|s| s.computed_at),
                };
                (symbol, status)
            })
            .collect()
    }

    pub fn stats(&self) -> HubStats {
        let subs = self.subscribers.read();
        let price_subscribers = subs.values().filter(|s| s.channel == Channel::Prices).count();
        HubStats {
            price_subscribers,
            indicator_subscribers: subs.len() - price_subscribers,
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            subscribers_removed: self.removed.load(Ordering::Relaxed),
        }
    }

    /// Periodic recompute loop; stops when `token` is cancelled.
    pub fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "indicator broadcast loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let delivered = self.recompute_and_broadcast();
                        debug!(delivered, "indicator broadcast cycle complete");
                    }
                }
            }
            info!("indicator broadcast loop stopped");
        })
    }
}

fn normalize_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn hub_with_history(symbols: &[&str], samples: usize) -> Arc<BroadcastHub> {
        let store = Arc::new(PriceHistoryStore::new(250));
        for symbol in symbols {
            for i in 0..samples {
                store.append(symbol, 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1, i as i64);
            }
        }
        Arc::new(BroadcastHub::new(store, IndicatorEngine::default(), 16))
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn tick(symbol: &str, price: f64) -> Tick {
        Tick {
            symbol: symbol.into(),
            price,
            change_24h: None,
            volume_24h: None,
            timestamp: 1,
        }
    }

    #[test]
    fn indicator_fan_out_respects_symbol_subscriptions() {
        let hub = hub_with_history(&["BTCUSDT", "ETHUSDT"], 60);
        let (a, mut rx_a) = hub.register_subscriber(Channel::Indicators);
        let (b, mut rx_b) = hub.register_subscriber(Channel::Indicators);
        let (_idle, mut rx_idle) = hub.register_subscriber(Channel::Indicators);
        hub.update_subscription(a, set(&["BTCUSDT"]), HashSet::new());
        hub.update_subscription(b, set(&["ethusdt"]), HashSet::new());

        assert_eq!(hub.recompute_and_broadcast(), 2);

        let got_a = drain(&mut rx_a);
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_a[0]["type"], "indicator_update");
        assert_eq!(got_a[0]["symbol"], "BTCUSDT");

        let got_b = drain(&mut rx_b);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_b[0]["symbol"], "ETHUSDT");

        assert!(drain(&mut rx_idle).is_empty());
    }

    #[test]
    fn snapshots_are_filtered_to_requested_families() {
        let hub = hub_with_history(&["BTCUSDT"], 60);
        let (a, mut rx) = hub.register_subscriber(Channel::Indicators);
        hub.update_subscription(a, set(&["BTCUSDT"]), [IndicatorFamily::Rsi].into_iter().collect());

        hub.recompute_and_broadcast();
        let msg = &drain(&mut rx)[0];
        assert!(msg["data"]["rsi"].is_object());
        assert!(msg["data"].get("macd").is_none());
        assert!(msg["data"].get("movingAverages").is_none());
    }

    #[test]
    fn dead_subscriber_is_removed_without_blocking_others() {
        let hub = hub_with_history(&["BTCUSDT"], 60);
        let (gone, rx_gone) = hub.register_subscriber(Channel::Indicators);
        let (alive, mut rx_alive) = hub.register_subscriber(Channel::Indicators);
        hub.update_subscription(gone, set(&["BTCUSDT"]), HashSet::new());
        hub.update_subscription(alive, set(&["BTCUSDT"]), HashSet::new());
        drop(rx_gone);

        assert_eq!(hub.recompute_and_broadcast(), 1);
        assert_eq!(drain(&mut rx_alive).len(), 1);
        assert!(hub.subscription(gone).is_none());
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.stats().subscribers_removed, 1);
    }

    #[test]
    fn too_little_history_sends_nothing() {
        let hub = hub_with_history(&["BTCUSDT"], 5);
        let (a, mut rx) = hub.register_subscriber(Channel::Indicators);
        hub.update_subscription(a, set(&["BTCUSDT"]), HashSet::new());

        assert_eq!(hub.recompute_and_broadcast(), 0);
        assert!(drain(&mut rx).is_empty());
        assert!(hub.indicator_status()["BTCUSDT"].last_computed_at.is_none());
        assert!(!hub.indicator_status()["BTCUSDT"].available);
    }

    #[test]
    fn ticks_go_to_matching_price_subscribers_only() {
        let hub = hub_with_history(&[], 0);
        let (p, mut rx_p) = hub.register_subscriber(Channel::Prices);
        let (i, mut rx_i) = hub.register_subscriber(Channel::Indicators);
        let (other, mut rx_other) = hub.register_subscriber(Channel::Prices);
        hub.update_subscription(p, set(&["BTCUSDT"]), HashSet::new());
        hub.update_subscription(i, set(&["BTCUSDT"]), HashSet::new());
        hub.update_subscription(other, set(&["ETHUSDT"]), HashSet::new());

        assert_eq!(hub.tick(&tick("BTCUSDT", 100.0)), 1);
        let got = drain(&mut rx_p);
        assert_eq!(got[0]["type"], "price_update");
        assert_eq!(got[0]["price"], 100.0);
        assert!(drain(&mut rx_i).is_empty());
        assert!(drain(&mut rx_other).is_empty());
    }

    #[test]
    fn full_queue_drops_but_keeps_subscriber() {
        let store = Arc::new(PriceHistoryStore::new(10));
        let hub = BroadcastHub::new(store, IndicatorEngine::default(), 1);
        let (p, mut rx) = hub.register_subscriber(Channel::Prices);
        hub.update_subscription(p, set(&["X"]), HashSet::new());

        assert_eq!(hub.tick(&tick("X", 1.0)), 1);
        assert_eq!(hub.tick(&tick("X", 2.0)), 0);
        assert_eq!(hub.stats().messages_dropped, 1);
        assert!(hub.subscription(p).is_some());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn protocol_state_machine() {
        let hub = hub_with_history(&["BTCUSDT"], 60);
        let (id, mut rx) = hub.register_subscriber(Channel::Indicators);
        assert_eq!(hub.subscription(id).unwrap().state, SubscriberState::Connected);

        hub.handle_message(id, r#"{"type":"ping"}"#);
        assert_eq!(drain(&mut rx)[0]["type"], "pong");

        hub.handle_message(id, r#"{"type":"subscribe_symbol","symbol":"btcusdt","indicators":["macd"]}"#);
        let got = drain(&mut rx);
        assert_eq!(got[0]["type"], "subscription_confirmed");
        assert_eq!(got[0]["symbols"], serde_json::json!(["BTCUSDT"]));
        assert_eq!(got[0]["indicators"], serde_json::json!(["macd"]));
        assert_eq!(got[1]["type"], "indicator_update");
        assert!(got[1]["data"].get("rsi").is_none());
        assert_eq!(hub.subscription(id).unwrap().state, SubscriberState::Subscribed);

        hub.handle_message(id, r#"{"type":"get_current_indicators","symbol":"DOGEUSDT"}"#);
        let got = drain(&mut rx);
        assert_eq!(got[0]["type"], "error");
        assert!(got[0]["message"].as_str().unwrap().contains("DOGEUSDT"));

        hub.handle_message(id, r#"{"type":"unsubscribe_symbol"}"#);
        assert_eq!(drain(&mut rx)[0]["symbols"], serde_json::json!([]));
        let view = hub.subscription(id).unwrap();
        assert_eq!(view.state, SubscriberState::Connected);

        hub.handle_message(id, r#"{"type":"launch"}"#);
        let got = drain(&mut rx);
        assert_eq!(got[0]["type"], "error");
        assert!(got[0]["message"].as_str().unwrap().contains("launch"));
    }

    #[test]
    fn price_channel_subscribe_and_unsubscribe() {
        let hub = hub_with_history(&[], 0);
        let (id, mut rx) = hub.register_subscriber(Channel::Prices);

        hub.handle_message(id, r#"{"type":"subscribe","symbols":["BTCUSDT","ethusdt"]}"#);
        let got = drain(&mut rx);
        assert_eq!(got[0]["symbols"], serde_json::json!(["BTCUSDT", "ETHUSDT"]));
        assert!(got[0].get("indicators").is_none());

        hub.handle_message(id, r#"{"type":"unsubscribe","symbols":["BTCUSDT"]}"#);
        assert_eq!(drain(&mut rx)[0]["symbols"], serde_json::json!(["ETHUSDT"]));
        assert_eq!(hub.tick(&tick("BTCUSDT", 1.0)), 0);
        assert_eq!(hub.tick(&tick("ETHUSDT", 1.0)), 1);
    }

    #[test]
    fn unregister_is_terminal() {
        let hub = hub_with_history(&[], 0);
        let (id, _rx) = hub.register_subscriber(Channel::Prices);
        assert!(hub.unregister_subscriber(id));
        assert!(!hub.unregister_subscriber(id));
        assert!(!hub.update_subscription(id, set(&["X"]), HashSet::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_broadcasts_on_interval() {
        let hub = hub_with_history(&["BTCUSDT"], 60);
        let (a, mut rx) = hub.register_subscriber(Channel::Indicators);
        hub.update_subscription(a, set(&["BTCUSDT"]), HashSet::new());

        let token = CancellationToken::new();
        let handle = hub.clone().run(Duration::from_secs(300), token.clone());

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(drain(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(hub.indicator_status()["BTCUSDT"].last_computed_at.is_some());

        token.cancel();
        handle.await.unwrap();
    }
}
