// =============================================================================
// Shared types used across the pricewire service
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single observed price for one symbol. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub symbol: String,
    pub price: f64,
    /// Exchange event time, UNIX milliseconds.
    pub timestamp: i64,
}

impl PriceSample {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

/// A decoded upstream tick. Carries the optional 24h statistics some feeds
/// attach so they can be relayed to price-channel clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub change_24h: Option<f64>,
    #[serde(default)]
    pub volume_24h: Option<f64>,
    pub timestamp: i64,
}

impl Tick {
    pub fn sample(&self) -> PriceSample {
        PriceSample::new(self.symbol.clone(), self.price, self.timestamp)
    }
}

/// Lifecycle of one named upstream feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Idle,
    /// Dialing, or waiting out a reconnect backoff.
    Connecting,
    Open,
    Closing,
    /// Reconnect ceiling reached; needs an explicit reconnect.
    Failed,
}

impl Default for FeedState {
    fn default() -> Self {
        Self::Idle
    }
}

impl FeedState {
    /// Whether a `connect()` for this feed should reuse the running task.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Current wall-clock time in UNIX milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
