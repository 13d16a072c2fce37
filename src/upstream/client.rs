// =============================================================================
// Upstream HTTP client — slow, quota-limited data providers
// =============================================================================
//
// Providers are configured as name -> base URL. A request is
// `GET {base}/{path}` with a fixed timeout; responses are JSON.
//
// Failure mapping (what the rate limiter retries is decided here):
//   429                          -> Throttled { retry_after }
//   connect / reset / broken pipe -> ConnectionReset
//   timeout                       -> Timeout
//   other non-2xx                 -> Status
// =============================================================================

use std::collections::HashMap;
use std::error::Error as _;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::UpstreamError;

/// Longest error body kept in `UpstreamError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Something that can answer `GET provider/path` with JSON.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch(&self, provider: &str, path: &str) -> Result<Value, UpstreamError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    providers: HashMap<String, String>,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(providers: HashMap<String, String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pricewire/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build upstream HTTP client")?;

        debug!(providers = providers.len(), timeout_secs = timeout.as_secs(), "HttpUpstream initialised");

        Ok(Self {
            client,
            providers,
            timeout,
        })
    }

    pub fn url_for(&self, provider: &str, path: &str) -> Result<String, UpstreamError> {
        let base = self
            .providers
            .get(provider)
            .ok_or_else(|| UpstreamError::InvalidRequest(format!("unknown provider: {provider}")))?;
        Ok(join_url(base, path))
    }

    fn classify(&self, provider: &str, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            return UpstreamError::Timeout(self.timeout);
        }
        if e.is_connect() || is_connection_reset(&e) {
            return UpstreamError::ConnectionReset {
                provider: provider.to_string(),
                message: e.to_string(),
            };
        }
        if e.is_decode() {
            return UpstreamError::Decode(e.to_string());
        }
        UpstreamError::Transport(e.to_string())
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    #[instrument(skip(self), name = "upstream::fetch")]
    async fn fetch(&self, provider: &str, path: &str) -> Result<Value, UpstreamError> {
        let url = self.url_for(provider, path)?;

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(provider, e))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::Throttled {
                provider: provider.to_string(),
                retry_after: parse_retry_after(resp.headers()),
            });
        }

        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(UpstreamError::Status {
                provider: provider.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp.json().await.map_err(|e| self.classify(provider, e))?;
        debug!(provider, status = status.as_u16(), "upstream response received");
        Ok(body)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

/// Walk the error chain for an OS-level reset.
fn is_connection_reset(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = err.source();
    }
    false
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let wait = when.signed_duration_since(Utc::now());
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
