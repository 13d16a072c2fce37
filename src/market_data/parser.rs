// =============================================================================
// Tick decoding for upstream exchange frames
// =============================================================================
//
// Accepted shapes (raw, or wrapped in a combined-stream `{stream, data}`
// envelope, or as a JSON array of either):
//
//   24hrTicker      { "e": "24hrTicker", "E": 1700.., "s": "BTCUSDT", "c": "37000.1", "P": "1.2", "v": "123.4" }
//   24hrMiniTicker  { "e": "24hrMiniTicker", "E": .., "s": .., "c": .., "o": .., "v": .. }
//   aggTrade/trade  { "e": "aggTrade", "E": .., "s": .., "p": "37000.1", "T": .. }
//   kline           { "e": "kline", "E": .., "s": .., "k": { "c": "37000.1", "T": .. } }
//   generic         { "symbol": "BTCUSD", "price": 37000.1, "timestamp": 1700.. }
//
// Subscription acknowledgements (`{"result": null, "id": 1}`) decode to no
// ticks. Numeric fields may be JSON strings or numbers.
// =============================================================================

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::types::{now_ms, Tick};

/// Decode one text frame into zero or more ticks.
pub fn parse_ticks(text: &str) -> Result<Vec<Tick>> {
    let root: Value = serde_json::from_str(text).context("feed frame is not valid JSON")?;
    parse_value(&root)
}

fn parse_value(root: &Value) -> Result<Vec<Tick>> {
    match root {
        Value::Array(items) => {
            let mut ticks = Vec::with_capacity(items.len());
            let mut first_err = None;
            for item in items {
                match parse_value(item) {
                    Ok(mut t) => ticks.append(&mut t),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            match first_err {
                Some(e) if ticks.is_empty() => Err(e),
                _ => Ok(ticks),
            }
        }
        Value::Object(map) => {
            if let Some(data) = map.get("data") {
                return parse_value(data);
            }
            if map.contains_key("result") && map.contains_key("id") {
                return Ok(Vec::new());
            }
            parse_event(root).map(|t| vec![t])
        }
        _ => bail!("unexpected feed frame type"),
    }
}

fn parse_event(v: &Value) -> Result<Tick> {
    let event = v.get("e").and_then(Value::as_str);
    let event_time = v.get("E").and_then(Value::as_i64);

    match event {
        Some("24hrTicker") => Ok(Tick {
            symbol: symbol_of(v, "s")?,
            price: number(&v["c"], "c")?,
            change_24h: optional_number(&v["P"]),
            volume_24h: optional_number(&v["v"]),
            timestamp: event_time.unwrap_or_else(now_ms),
        }),
        Some("24hrMiniTicker") => {
            let price = number(&v["c"], "c")?;
            let change_24h = optional_number(&v["o"])
                .filter(|open| *open != 0.0)
                .map(|open| (price - open) / open * 100.0);
            Ok(Tick {
                symbol: symbol_of(v, "s")?,
                price,
                change_24h,
                volume_24h: optional_number(&v["v"]),
                timestamp: event_time.unwrap_or_else(now_ms),
            })
        }
        Some("aggTrade") | Some("trade") => Ok(Tick {
            symbol: symbol_of(v, "s")?,
            price: number(&v["p"], "p")?,
            change_24h: None,
            volume_24h: None,
            timestamp: v
                .get("T")
                .and_then(Value::as_i64)
                .or(event_time)
                .unwrap_or_else(now_ms),
        }),
        Some("kline") => {
            let k = v.get("k").context("missing field k")?;
            Ok(Tick {
                symbol: symbol_of(v, "s")?,
                price: number(&k["c"], "k.c")?,
                change_24h: None,
                volume_24h: None,
                timestamp: event_time
                    .or_else(|| k.get("T").and_then(Value::as_i64))
                    .unwrap_or_else(now_ms),
            })
        }
        Some(other) => bail!("unsupported feed event type: {other}"),
        None => Ok(Tick {
            symbol: symbol_of(v, "symbol")?,
            price: number(&v["price"], "price")?,
            change_24h: optional_number(&v["change24h"]),
            volume_24h: optional_number(&v["volume24h"]),
            timestamp: v
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ms),
        }),
    }
}

fn symbol_of(v: &Value, field: &str) -> Result<String> {
    let s = v
        .get(field)
        .and_then(Value::as_str)
        .with_context(|| format!("missing field {field}"))?;
    if s.is_empty() {
        bail!("empty symbol in field {field}");
    }
    Ok(s.to_uppercase())
}

/// Exchanges send numbers as strings; accept both. Rejects non-finite and
/// non-positive prices.
fn number(val: &Value, name: &str) -> Result<f64> {
    let n = match val {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        Value::Null => bail!("missing field {name}"),
        _ => bail!("field {name} has unexpected JSON type"),
    };
    if !n.is_finite() || n <= 0.0 {
        bail!("field {name} is not a positive finite number: {n}");
    }
    Ok(n)
}

fn optional_number(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}
