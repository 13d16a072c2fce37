// =============================================================================
// Wire messages for the live price and indicator channels
// =============================================================================
//
// Client -> server (JSON, `type`-tagged):
//   subscribe               { symbols: [..] }                     price channel
//   unsubscribe             { symbols?: [..] }                    omit = all
//   subscribe_symbol        { symbol, indicators?: [family..] }   indicator channel
//   unsubscribe_symbol      { symbol? }                           omit = all
//   get_current_indicators  { symbol? }                           omit = subscribed
//   ping
//
// Anything else decodes to `Unsupported` and is answered with an `error`.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::indicators::{IndicatorFamily, IndicatorSnapshot};
use crate::types::{now_ms, Tick};

/// Which real-time endpoint a subscriber connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Prices,
    Indicators,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        symbols: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Option<Vec<String>>,
    },
    SubscribeSymbol {
        symbol: String,
        #[serde(default)]
        indicators: Option<Vec<IndicatorFamily>>,
    },
    UnsubscribeSymbol {
        #[serde(default)]
        symbol: Option<String>,
    },
    GetCurrentIndicators {
        #[serde(default)]
        symbol: Option<String>,
    },
    Ping,
    #[serde(skip)]
    Unsupported {
        reason: String,
    },
}

impl ClientMessage {
    /// Decode a client text frame. Never fails: unknown or malformed input
    /// becomes `Unsupported`.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                let kind = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string));
                let reason = match kind {
                    Some(kind) if !KNOWN_TYPES.contains(&kind.as_str()) => {
                        format!("unsupported message type: {kind}")
                    }
                    _ => format!("malformed message: {e}"),
                };
                ClientMessage::Unsupported { reason }
            }
        }
    }
}

const KNOWN_TYPES: [&str; 6] = [
    "subscribe",
    "unsubscribe",
    "subscribe_symbol",
    "unsubscribe_symbol",
    "get_current_indicators",
    "ping",
];

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connection {
        status: &'static str,
        client_id: Uuid,
        channel: Channel,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    PriceUpdate {
        symbol: String,
        price: f64,
        change_24h: Option<f64>,
        volume_24h: Option<f64>,
        timestamp: i64,
    },
    SubscriptionConfirmed {
        symbols: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        indicators: Vec<IndicatorFamily>,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    IndicatorUpdate {
        symbol: String,
        data: IndicatorSnapshot,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn connected(client_id: Uuid, channel: Channel) -> Self {
        Self::Connection {
            status: "connected",
            client_id,
            channel,
            timestamp: now_ms(),
        }
    }

    pub fn price_update(tick: &Tick) -> Self {
        Self::PriceUpdate {
            symbol: tick.symbol.clone(),
            price: tick.price,
            change_24h: tick.change_24h,
            volume_24h: tick.volume_24h,
            timestamp: tick.timestamp,
        }
    }

    pub fn indicator_update(data: IndicatorSnapshot) -> Self {
        Self::IndicatorUpdate {
            symbol: data.symbol.clone(),
            data,
            timestamp: now_ms(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong { timestamp: now_ms() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn to_json(&self) -> String {
        // only non-string map keys can fail here, and none are used
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {e}"}}"#)
        })
    }
}
