// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, deterministic functions over a price slice. Every `latest_*` helper
// returns `Option<T>` so insufficient data surfaces as "unavailable" rather
// than a misleading number. `engine` assembles them into snapshots.

pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod macd;
pub mod rsi;

pub use engine::{IndicatorEngine, IndicatorFamily, IndicatorParams, IndicatorSnapshot};
