//! Per-request deadline.
//!
//! Every store, cache and key-manager call made on behalf of a request runs
//! under the same [`Deadline`]: once it passes, the call is abandoned and
//! the whole request fails with a timeout.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::ApiError;

/// The request chain ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Absolute point in time by which a request must complete.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Time left, zero once passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Run `fut`, abandoning it when the deadline passes.
    pub async fn bound<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| DeadlineExceeded)
    }

    /// Run a fallible collaborator call (store, cache, signer) under the
    /// deadline, logging failures and mapping them onto the API taxonomy.
    pub async fn call<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T, ApiError>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        match self.bound(fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(operation, error = %e, "Collaborator call failed");
                Err(ApiError::Internal)
            }
            Err(DeadlineExceeded) => {
                tracing::warn!(operation, "Request deadline exceeded");
                Err(ApiError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert_eq!(deadline.bound(async { 7 }).await, Ok(7));
        assert!(!deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn abandons_slow_future() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let slow = tokio::time::sleep(Duration::from_secs(10));
        assert_eq!(deadline.bound(slow).await, Err(DeadlineExceeded));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn call_maps_failures() {
        let deadline = Deadline::after(Duration::from_millis(50));

        let ok: Result<u8, ApiError> = deadline.call("ok", async { Ok::<_, String>(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let failed: Result<u8, ApiError> = deadline
            .call("store", async { Err::<u8, _>("db down".to_string()) })
            .await;
        assert!(matches!(failed, Err(ApiError::Internal)));

        let slow: Result<(), ApiError> = deadline
            .call("slow", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(slow, Err(ApiError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_shared_by_sequential_calls() {
        let deadline = Deadline::after(Duration::from_millis(100));
        deadline
            .bound(tokio::time::sleep(Duration::from_millis(70)))
            .await
            .unwrap();
        // 30ms left: a second 70ms call must fail
        assert!(
            deadline
                .bound(tokio::time::sleep(Duration::from_millis(70)))
                .await
                .is_err()
        );
    }
}
