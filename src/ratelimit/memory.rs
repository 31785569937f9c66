//! In-process token buckets backed by governor's keyed limiter.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};

use super::{Decision, RateLimitError, RateLimitStore};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// `tokens` requests per `interval`, refilled continuously.
pub struct MemoryRateLimitStore {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    limit: u32,
}

impl MemoryRateLimitStore {
    /// Create a limiter allowing bursts of `tokens` and refilling the whole
    /// bucket over `interval`.
    #[must_use]
    pub fn new(tokens: u32, interval: Duration) -> Self {
        let burst = NonZeroU32::new(tokens).unwrap_or(NonZeroU32::MIN);
        let period = interval / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        let clock = DefaultClock::default();
        Self {
            limiter: RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock.clone()),
            clock,
            limit: burst.get(),
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn take(&self, key: &str) -> Result<Decision, RateLimitError> {
        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => Ok(Decision::allow(self.limit)),
            Err(not_until) => Ok(Decision {
                allowed: false,
                limit: self.limit,
                retry_after: Some(not_until.wait_time_from(self.clock.now())),
            }),
        }
    }

    fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    fn len(&self) -> usize {
        self.limiter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_deny() {
        let store = MemoryRateLimitStore::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            let decision = store.take("a").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.limit, 3);
        }

        let denied = store.take("a").await.unwrap();
        assert!(!denied.allowed);
        let wait = denied.retry_after.unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryRateLimitStore::new(1, Duration::from_secs(60));

        assert!(store.take("a").await.unwrap().allowed);
        assert!(!store.take("a").await.unwrap().allowed);
        assert!(store.take("b").await.unwrap().allowed);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_takes_never_exceed_bucket() {
        let store = std::sync::Arc::new(MemoryRateLimitStore::new(10, Duration::from_secs(3600)));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("shared").await.unwrap().allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let store = MemoryRateLimitStore::new(1, Duration::from_millis(20));

        assert!(store.take("a").await.unwrap().allowed);
        assert!(!store.take("a").await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.take("a").await.unwrap().allowed);
    }
}
