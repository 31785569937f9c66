//! Per-caller request rate limiting
//!
//! Limiter state lives behind [`RateLimitStore`] so the in-process governor
//! bucket can be swapped for a shared backend. Keys are salted digests of
//! the API key (or the client IP when no key is sent): the raw credential
//! never reaches the limiter.

mod memory;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::config::{RateLimitConfig, resolve_secret};
use crate::digest::KeyedDigest;

pub use memory::MemoryRateLimitStore;

/// Outcome of taking one token from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Bucket size, reported in `X-RateLimit-Limit`
    pub limit: u32,
    /// When the next token becomes available, if denied
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// An admitting decision.
    #[must_use]
    pub fn allow(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            retry_after: None,
        }
    }
}

/// Limiter backend failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    /// The backing store could not be consulted
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for limiter buckets.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Backend name, for logs.
    fn backend(&self) -> &'static str;

    /// Take one token for `key`.
    async fn take(&self, key: &str) -> Result<Decision, RateLimitError>;

    /// Drop state for keys that are back at a full bucket.
    fn prune(&self) {}

    /// Number of tracked keys.
    fn len(&self) -> usize {
        0
    }

    /// Whether no key is tracked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backend used when rate limiting is disabled.
#[derive(Debug, Default)]
pub struct NoopRateLimitStore;

#[async_trait]
impl RateLimitStore for NoopRateLimitStore {
    fn backend(&self) -> &'static str {
        "noop"
    }

    async fn take(&self, _key: &str) -> Result<Decision, RateLimitError> {
        Ok(Decision::allow(0))
    }
}

/// Build the limiter backend selected by configuration.
#[must_use]
pub fn store_for(config: &RateLimitConfig) -> Arc<dyn RateLimitStore> {
    if config.enabled {
        Arc::new(MemoryRateLimitStore::new(config.tokens, config.interval))
    } else {
        Arc::new(NoopRateLimitStore)
    }
}

/// Derives limiter keys from request metadata.
pub struct RateLimitKeys {
    digest: KeyedDigest,
    prefix: String,
    api_key_header: String,
}

impl RateLimitKeys {
    /// Create a key function salting with the configured secret.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the salt cannot be resolved.
    pub fn new(config: &RateLimitConfig, api_key_header: &str) -> crate::Result<Self> {
        Ok(Self {
            digest: KeyedDigest::new(resolve_secret(&config.hmac_key)?),
            prefix: config.key_prefix.clone(),
            api_key_header: api_key_header.to_string(),
        })
    }

    /// `<prefix>apikey:<digest>` when an API key is present, otherwise
    /// `<prefix>ip:<digest>`.
    #[must_use]
    pub fn key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let api_key = headers
            .get(self.api_key_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(api_key) = api_key {
            return format!("{}apikey:{}", self.prefix, self.digest.hex(api_key));
        }

        let ip = extract_client_ip(headers)
            .or_else(|| peer.map(|p| p.ip()))
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        format!("{}ip:{}", self.prefix, self.digest.hex(ip))
    }
}

/// Client IP from `X-Forwarded-For` (first hop) or `X-Real-IP`.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}
