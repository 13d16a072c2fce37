// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin operational surface over the core components. Everything lives under
// `/api/v1/`; the two live channels are mounted at `/ws/prices` and
// `/ws/indicators`.
//
// CORS is permissive; the service sits behind an internal gateway.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::{AppState, StatusReport};
use crate::cache::Tier;
use crate::error::UpstreamError;
use crate::indicators::IndicatorFamily;
use crate::market_data::price_history::HistoryStats;
use crate::types::PriceSample;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health & status ─────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        // ── Price history & indicators ──────────────────────────────
        .route("/api/v1/indicators/:symbol", get(indicators))
        .route("/api/v1/history/:symbol", get(history))
        // ── Cache-backed upstream reads ─────────────────────────────
        .route("/api/v1/upstream/:provider/*path", get(upstream))
        .route("/api/v1/cache/flush", post(flush_cache))
        .route("/api/v1/cache/:key", delete(delete_cache_key))
        // ── Feed control ────────────────────────────────────────────
        .route("/api/v1/feeds/:name/reconnect", post(reconnect_feed))
        // ── Live channels ───────────────────────────────────────────
        .route("/ws/prices", get(crate::api::ws::prices_handler))
        .route("/ws/indicators", get(crate::api::ws::indicators_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// =============================================================================
// Health & status
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    feeds_connected: bool,
    subscribers: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        feeds_connected: state.feeds.status().connected,
        subscribers: state.hub.subscriber_count(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.status())
}

// =============================================================================
// Indicators & history
// =============================================================================

#[derive(Debug, Deserialize)]
struct IndicatorQuery {
    /// Comma-separated family names; absent means all.
    indicators: Option<String>,
}

fn parse_families(raw: &str) -> Result<HashSet<IndicatorFamily>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_value::<IndicatorFamily>(Value::String(s.to_string()))
                .map_err(|_| format!("unknown indicator family: {s}"))
        })
        .collect()
}

async fn indicators(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<IndicatorQuery>,
) -> Response {
    let families = match query.indicators.as_deref().map(parse_families) {
        Some(Ok(f)) if !f.is_empty() => f,
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
        _ => IndicatorFamily::all(),
    };

    let symbol = symbol.trim().to_uppercase();
    match state.hub.current_snapshot(&symbol) {
        Some(snapshot) => Json(snapshot.filtered(&families)).into_response(),
        None => {
            let stats = state.history.stats(&symbol);
            error_response(
                StatusCode::NOT_FOUND,
                format!(
                    "indicators unavailable for {symbol}: {} of {} samples",
                    stats.sample_count,
                    state.hub.engine().min_samples()
                ),
            )
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    symbol: String,
    #[serde(flatten)]
    stats: HistoryStats,
    samples: Vec<PriceSample>,
}

async fn history(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> Json<HistoryResponse> {
    let symbol = symbol.trim().to_uppercase();
    Json(HistoryResponse {
        stats: state.history.stats(&symbol),
        samples: state.history.snapshot(&symbol),
        symbol,
    })
}

// =============================================================================
// Cache-backed upstream reads
// =============================================================================

/// Split `tier` out of a raw query string. Every other parameter is kept,
/// in order and still encoded, for the upstream request.
fn split_tier(raw: Option<&str>) -> (Option<&str>, String) {
    let mut tier = None;
    let mut rest = Vec::new();
    for pair in raw.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("tier", value)) => tier = Some(value),
            _ if pair == "tier" => tier = Some(""),
            _ => rest.push(pair),
        }
    }
    (tier, rest.join("&"))
}

async fn upstream(
    State(state): State<Arc<AppState>>,
    Path((provider, path)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Response {
    let (tier, forwarded) = split_tier(raw.as_deref());
    let tier = match tier.map(str::parse::<Tier>) {
        None => Tier::Minute,
        Some(Ok(t)) => t,
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let mut path = format!("/{}", path.trim_start_matches('/'));
    if !forwarded.is_empty() {
        path.push('?');
        path.push_str(&forwarded);
    }
    let key = format!("{provider}:{path}");

    match state.fetcher.fetch(&key, &provider, &path, tier).await {
        Ok(lookup) => Json(lookup).into_response(),
        Err(e) => {
            warn!(%provider, %path, error = %e, "upstream read failed with nothing cached");
            let code = match e {
                UpstreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(code, e.to_string())
        }
    }
}

async fn delete_cache_key(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> impl IntoResponse {
    let removed = state.cache.del(&key);
    info!(%key, removed, "cache key deleted via API");
    Json(json!({ "key": key, "removed": removed }))
}

async fn flush_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.cache.flush();
    info!("cache flushed via API");
    Json(json!({ "flushed": true }))
}

// =============================================================================
// Feed control
// =============================================================================

async fn reconnect_feed(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.feeds.reconnect(&name) {
        Some(conn) => {
            info!(feed = %name, "feed reconnect requested via API");
            Json(json!({ "feed": conn.name(), "endpoint": conn.endpoint(), "state": conn.state() })).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("unknown feed: {name}")),
    }
}

// =============================================================================
// Tests
// =============================================================================
