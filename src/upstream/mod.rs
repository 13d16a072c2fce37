// =============================================================================
// Upstream data providers
// =============================================================================
//
// Everything that talks to slow, quota-limited HTTP providers:
//
//   client      — reqwest-backed `UpstreamSource` with timeout + error mapping
//   rate_limit  — process-wide per-provider spacing and throttle backoff
//   fetcher     — cache-first reads that fill through the limiter
//   seed        — cold-start price history from exchange klines

pub mod client;
pub mod fetcher;
pub mod rate_limit;
pub mod seed;

pub use client::{HttpUpstream, UpstreamSource};
pub use fetcher::CachedFetcher;
pub use rate_limit::{RateLimiter, RateLimiterConfig};
