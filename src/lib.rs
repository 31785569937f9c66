//! Verification Gateway Library
//!
//! Device-facing side of a diagnosis verification service: a human-issued
//! one-time code is redeemed for a short-lived signed token, and the token
//! is exchanged for a signed certificate attesting the diagnosis.
//!
//! # Features
//!
//! - **Code exchange**: status checks, issuance, single-use redemption and early revocation
//! - **Certificates**: one-time token consumption, pluggable certificate claims
//! - **Key management**: versioned HMAC or PEM (ES256 / EdDSA) signing keys with rotation
//! - **Rate limiting**: governor token buckets keyed by salted API key or client IP digests
//! - **Chaff**: decoy requests answered with traffic-shaped padding
//! - **Realm isolation**: every caller is scoped to one realm; other realms' codes do not exist
//!
//! Every API request runs an explicit pipeline of stages
//! (`rate_limit -> chaff -> auth -> handler`); see [`gateway::pipeline`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod audit;
pub mod authorization;
pub mod cache;
pub mod certificate;
pub mod chaff;
pub mod cli;
pub mod codes;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod keys;
pub mod ratelimit;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
