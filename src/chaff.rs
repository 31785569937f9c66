//! Decoy (chaff) traffic handling
//!
//! Devices send periodic chaff requests so that a passive observer cannot
//! tell which devices are really uploading a diagnosis. A tracker per
//! endpoint remembers the latency and body size of recent real responses;
//! chaff requests are answered with a padded body of the same average size
//! after the same average latency, without touching storage.

use std::collections::VecDeque;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use serde_json::json;

use crate::config::ChaffConfig;

/// Bytes of `{"padding":""}` around the padding string
const ENVELOPE_LEN: usize = 14;

const PADDING_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    size: usize,
}

/// Shape decoy responses are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChaffProfile {
    /// Mean latency of recorded real responses
    pub latency: Duration,
    /// Mean body size of recorded real responses
    pub size: usize,
}

/// Tracks real response shapes for one endpoint and answers chaff.
pub struct ChaffTracker {
    samples: Mutex<VecDeque<Sample>>,
    capacity: usize,
    sample_rate: f64,
    header: String,
    defaults: ChaffProfile,
}

impl ChaffTracker {
    /// Create a tracker from configuration.
    #[must_use]
    pub fn new(config: &ChaffConfig) -> Self {
        let capacity = config.history.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sample_rate: config.sample_rate.clamp(0.0, 1.0),
            header: config.header.clone(),
            defaults: ChaffProfile {
                latency: config.default_latency,
                size: config.default_size,
            },
        }
    }

    /// Whether the request is flagged as chaff (header present, non-empty).
    #[must_use]
    pub fn is_chaff(&self, headers: &HeaderMap) -> bool {
        headers
            .get(self.header.as_str())
            .is_some_and(|v| !v.as_bytes().is_empty())
    }

    /// Record a real response; only `sample_rate` of calls are kept.
    pub fn record(&self, latency: Duration, size: usize) {
        if self.sample_rate < 1.0 && rand::random::<f64>() >= self.sample_rate {
            return;
        }

        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(Sample { latency, size });
    }

    /// Current decoy shape: recorded means, or the configured defaults.
    #[must_use]
    pub fn profile(&self) -> ChaffProfile {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return self.defaults;
        }

        let n = samples.len();
        let total_latency: Duration = samples.iter().map(|s| s.latency).sum();
        let total_size: usize = samples.iter().map(|s| s.size).sum();
        ChaffProfile {
            latency: total_latency / u32::try_from(n).unwrap_or(u32::MAX),
            size: total_size / n,
        }
    }

    /// Number of samples currently held.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Produce a decoy response shaped like real traffic.
    ///
    /// Latency and size are jittered by ±20% around the profile.
    pub async fn respond(&self) -> Response {
        let profile = self.profile();
        let latency = profile.latency.mul_f64(rand::random_range(0.8..=1.2));
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let size = (profile.size as f64 * rand::random_range(0.8..=1.2)) as usize;

        tokio::time::sleep(latency).await;

        (
            StatusCode::OK,
            Json(json!({ "padding": padding(size.saturating_sub(ENVELOPE_LEN)) })),
        )
            .into_response()
    }
}

fn padding(len: usize) -> String {
    (0..len)
        .map(|_| char::from(PADDING_ALPHABET[rand::random_range(0..PADDING_ALPHABET.len())]))
        .collect()
}
