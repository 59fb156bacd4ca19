//! Token-bucket rate limiting for upstream data adapters.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use thiserror::Error;

/// Raised when a token cannot be obtained before the caller's deadline.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate limit exceeded; no token available within {waited_ms}ms")]
pub struct RateLimitExceeded {
    pub waited_ms: u64,
}

/// Per-adapter token bucket sized from the adapter's documented quota minus
/// a safety margin.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    deadline: Duration,
}

impl RateLimiter {
    /// Build a limiter allowing `quota_per_minute - margin` requests/minute.
    /// Waits up to `deadline` for a token before failing.
    #[must_use]
    pub fn per_minute(quota_per_minute: u32, margin: u32, deadline: Duration) -> Self {
        let effective = quota_per_minute.saturating_sub(margin).max(1);
        let quota = Quota::per_minute(NonZeroU32::new(effective).expect("effective quota >= 1"));
        Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            deadline,
        }
    }

    /// Obtain a token, blocking the task up to the configured deadline.
    /// Callers treat the failure as a normal adapter failure for failover.
    pub async fn acquire(&self) -> Result<(), RateLimitExceeded> {
        let wait = self.inner.until_ready();
        match tokio::time::timeout(self.deadline, wait).await {
            Ok(()) => Ok(()),
            Err(_) => Err(RateLimitExceeded {
                waited_ms: self.deadline.as_millis() as u64,
            }),
        }
    }

    /// Non-blocking probe used by tests.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn margin_shrinks_the_bucket() {
        let limiter = RateLimiter::per_minute(3, 1, Duration::from_millis(10));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn exhausted_bucket_fails_at_deadline() {
        let limiter = RateLimiter::per_minute(2, 1, Duration::from_millis(20));
        assert!(limiter.acquire().await.is_ok());
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.waited_ms, 20);
    }
}
