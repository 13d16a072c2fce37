// =============================================================================
// Error taxonomy for the feed and upstream paths
// =============================================================================
//
// Application plumbing uses `anyhow`; these enums exist where a caller must
// branch on the kind of failure (retry a throttle, reconnect a feed).
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Failure of a single upstream data-provider call.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// Provider signalled "too many requests".
    #[error("provider {provider} throttled the request")]
    Throttled {
        provider: String,
        /// Server-advertised wait (`Retry-After`), if any.
        retry_after: Option<Duration>,
    },

    /// Connection reset / refused mid-request; treated like throttling.
    #[error("connection reset talking to {provider}: {message}")]
    ConnectionReset { provider: String, message: String },

    /// The call exceeded the fixed upstream timeout.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status other than 429.
    #[error("provider {provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    /// Body could not be decoded.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// Unknown provider name or malformed request.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    /// Any other transport failure.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Whether the rate limiter should back off and retry this error.
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::ConnectionReset { .. })
    }

    /// Minimum wait the provider asked for, if it told us.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of one feed connection session. Always recovered by the
/// reconnect policy; never surfaced to callers as fatal.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("feed transport error: {0}")]
    Transport(String),

    #[error("no message received for {0:?}")]
    IdleTimeout(Duration),

    #[error("feed closed by remote")]
    Closed,
}
