// =============================================================================
// Feed Connection Manager — one self-healing upstream socket per named feed
// =============================================================================
//
// Each feed runs as its own task:
//   connect -> Open (attempts reset) -> read frames -> decode ticks -> handler
//   on drop / error / idle timeout -> backoff -> reconnect
//   after the attempt ceiling -> Failed, until `reconnect(name)` is called
//
// `close_all` cancels every task; a cancelled feed never schedules a
// reconnect. Malformed frames are logged and dropped, never fatal.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::parser::parse_ticks;
use super::reconnect::ReconnectPolicy;
use crate::error::FeedError;
use crate::types::{FeedState, Tick};

/// Callback invoked for every decoded tick, in arrival order.
pub type TickHandler = Arc<dyn Fn(Tick) + Send + Sync>;

/// Inbound frames of one open session.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<FeedFrame, FeedError>> + Send>>;

#[derive(Debug, Clone)]
pub enum FeedFrame {
    Text(String),
    /// Ping/pong/binary: proves liveness, carries no ticks.
    Control,
}

/// Opens sessions to an upstream endpoint.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<FrameStream, FeedError>;
}

/// Production transport over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn connect(&self, endpoint: &str) -> Result<FrameStream, FeedError> {
        let (ws_stream, _response) =
            connect_async(endpoint)
                .await
                .map_err(|e| FeedError::Connect {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })?;

        // tungstenite answers pings itself while we read.
        let (_write, read) = ws_stream.split();
        let frames = read.map(|msg| match msg {
            Ok(Message::Text(text)) => Ok(FeedFrame::Text(text)),
            Ok(Message::Close(_)) => Err(FeedError::Closed),
            Ok(_) => Ok(FeedFrame::Control),
            Err(e) => Err(FeedError::Transport(e.to_string())),
        });
        Ok(Box::pin(frames))
    }
}

// ---------------------------------------------------------------------------
// FeedConnection
// ---------------------------------------------------------------------------

/// Observable state of one named feed. Mutated only by its own task and by
/// the manager.
pub struct FeedConnection {
    name: String,
    endpoint: String,
    on_tick: TickHandler,
    state: RwLock<FeedState>,
    attempts: AtomicU32,
    last_error: RwLock<Option<String>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    ticks_received: AtomicU64,
    malformed_messages: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedConnection {
    fn new(name: &str, endpoint: &str, on_tick: TickHandler, cancel: CancellationToken) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            on_tick,
            state: RwLock::new(FeedState::Connecting),
            attempts: AtomicU32::new(0),
            last_error: RwLock::new(None),
            connected_at: RwLock::new(None),
            ticks_received: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            cancel,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn ticks_received(&self) -> u64 {
        self.ticks_received.load(Ordering::Relaxed)
    }

    pub fn malformed_messages(&self) -> u64 {
        self.malformed_messages.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: FeedState) {
        *self.state.write() = state;
    }

    fn mark_open(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        *self.connected_at.write() = Some(Utc::now());
        self.set_state(FeedState::Open);
        info!(feed = %self.name, endpoint = %self.endpoint, "feed connected");
    }

    fn handle_text(&self, text: &str) {
        match parse_ticks(text) {
            Ok(ticks) => {
                for tick in ticks {
                    self.ticks_received.fetch_add(1, Ordering::Relaxed);
                    debug!(feed = %self.name, symbol = %tick.symbol, price = tick.price, "tick");
                    (self.on_tick)(tick);
                }
            }
            Err(e) => {
                self.malformed_messages.fetch_add(1, Ordering::Relaxed);
                warn!(feed = %self.name, error = %e, "dropping malformed feed message");
            }
        }
    }

    fn status(&self) -> FeedConnectionStatus {
        FeedConnectionStatus {
            name: self.name.clone(),
            endpoint: self.endpoint().to_string(),
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts(),
            last_error: self.last_error(),
            ticks_received: self.ticks_received(),
            malformed_messages: self.malformed_messages(),
            connected_at: *self.connected_at.read(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConnectionStatus {
    pub name: String,
    pub endpoint: String,
    pub state: FeedState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub ticks_received: u64,
    pub malformed_messages: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    /// At least one feed is open.
    pub connected: bool,
    pub active_connections: Vec<String>,
    pub reconnect_attempts: BTreeMap<String, u32>,
    /// Feeds that hit the reconnect ceiling and need operator action.
    pub failed: Vec<String>,
    pub connections: Vec<FeedConnectionStatus>,
}

// ---------------------------------------------------------------------------
// FeedConnectionManager
// ---------------------------------------------------------------------------

pub struct FeedConnectionManager {
    connections: RwLock<HashMap<String, Arc<FeedConnection>>>,
    transport: Arc<dyn FeedTransport>,
    policy: ReconnectPolicy,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl FeedConnectionManager {
    pub fn new(transport: Arc<dyn FeedTransport>, policy: ReconnectPolicy, idle_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            transport,
            policy,
            idle_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Open the feed `name`, or return the running one if it is already
    /// connecting or open. Must be called inside a tokio runtime.
    pub fn connect(&self, name: &str, endpoint: &str, on_tick: TickHandler) -> Arc<FeedConnection> {
        let mut map = self.connections.write();

        if let Some(existing) = map.get(name) {
            if existing.state().is_live() {
                debug!(feed = %name, state = %existing.state(), "connect ignored, feed already live");
                return existing.clone();
            }
            existing.cancel.cancel();
        }

        let conn = Arc::new(FeedConnection::new(
            name,
            endpoint,
            on_tick,
            self.shutdown.child_token(),
        ));
        let handle = tokio::spawn(run_connection(
            conn.clone(),
            self.transport.clone(),
            self.policy.clone(),
            self.idle_timeout,
        ));
        *conn.task.lock() = Some(handle);
        map.insert(name.to_string(), conn.clone());

        info!(feed = %name, endpoint = %endpoint, "feed connection started");
        conn
    }

    /// Restart a failed or idle feed with its remembered endpoint and tick
    /// handler. `None` if the feed was never connected.
    pub fn reconnect(&self, name: &str) -> Option<Arc<FeedConnection>> {
        let (endpoint, on_tick) = {
            let map = self.connections.read();
            let conn = map.get(name)?;
            (conn.endpoint.clone(), conn.on_tick.clone())
        };
        info!(feed = %name, "explicit reconnect requested");
        Some(self.connect(name, &endpoint, on_tick))
    }

    pub fn connection(&self, name: &str) -> Option<Arc<FeedConnection>> {
        self.connections.read().get(name).cloned()
    }

    /// Tear every feed down without triggering reconnects and wait for the
    /// tasks to finish.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<FeedConnection>> = self.connections.write().drain().map(|(_, c)| c).collect();

        for conn in &conns {
            conn.set_state(FeedState::Closing);
            conn.cancel.cancel();
        }

        for conn in &conns {
            let task = conn.task.lock().take();
            if let Some(task) = task {
                if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                    warn!(feed = %conn.name, "feed task did not stop within 5s");
                }
            }
            conn.set_state(FeedState::Idle);
        }

        info!(count = conns.len(), "all feed connections closed");
    }

    pub fn status(&self) -> FeedStatus {
        let map = self.connections.read();
        let mut connections: Vec<FeedConnectionStatus> = map.values().map(|c| c.status()).collect();
        connections.sort_by(|a, b| a.name.cmp(&b.name));

        let active_connections: Vec<String> = connections
            .iter()
            .filter(|c| c.state == FeedState::Open)
            .map(|c| c.name.clone())
            .collect();
        let failed = connections
            .iter()
            .filter(|c| c.state == FeedState::Failed)
            .map(|c| c.name.clone())
            .collect();
        let reconnect_attempts = connections
            .iter()
            .map(|c| (c.name.clone(), c.reconnect_attempts))
            .collect();

        FeedStatus {
            connected: !active_connections.is_empty(),
            active_connections,
            reconnect_attempts,
            failed,
            connections,
        }
    }
}

impl Drop for FeedConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run_connection(
    conn: Arc<FeedConnection>,
    transport: Arc<dyn FeedTransport>,
    policy: ReconnectPolicy,
    idle_timeout: Duration,
) {
    loop {
        conn.set_state(FeedState::Connecting);

        let outcome = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            outcome = run_session(&conn, transport.as_ref(), idle_timeout) => outcome,
        };
        if conn.cancel.is_cancelled() {
            break;
        }

        let reason = match outcome {
            Ok(()) => "stream ended".to_string(),
            Err(e) => e.to_string(),
        };
        *conn.last_error.write() = Some(reason.clone());

        let attempts = conn.reconnect_attempts();
        let Some(delay) = policy.delay_for(attempts) else {
            conn.set_state(FeedState::Failed);
            error!(
                feed = %conn.name,
                attempts,
                last_error = %reason,
                "reconnect ceiling reached, feed marked failed"
            );
            return;
        };

        conn.attempts.store(attempts + 1, Ordering::Relaxed);
        warn!(
            feed = %conn.name,
            attempt = attempts + 1,
            max_attempts = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "feed disconnected, scheduling reconnect"
        );

        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    conn.set_state(FeedState::Idle);
    info!(feed = %conn.name, "feed stopped");
}

/// One connected session. Returns when the upstream goes away.
async fn run_session(
    conn: &FeedConnection,
    transport: &dyn FeedTransport,
    idle_timeout: Duration,
) -> Result<(), FeedError> {
    let mut frames = transport.connect(&conn.endpoint).await?;
    conn.mark_open();

    loop {
        let next = tokio::time::timeout(idle_timeout, frames.next())
            .await
            .map_err(|_| FeedError::IdleTimeout(idle_timeout))?;

        match next {
            Some(Ok(FeedFrame::Text(text))) => conn.handle_text(&text),
            Some(Ok(FeedFrame::Control)) => {}
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

/// Binance combined-stream URL carrying the 24h ticker for every symbol.
pub fn build_ticker_url(base: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@ticker", s.to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", base.trim_end_matches('/'), streams.join("/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
