//! Rate limiter trait for abstracting the limiter behind the HTTP middleware.

use async_trait::async_trait;

use super::decision::Decision;
use super::limiter::SlidingWindowLimiter;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The middleware only needs to consume tokens, so it works against this
/// trait rather than the concrete limiter. Tests swap in doubles that fail on
/// purpose.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Record `cost` events for `identifier` under `rule_name`.
    async fn consume_token(&self, identifier: &str, rule_name: &str, cost: u32) -> Result<Decision>;

    /// Current time in epoch milliseconds, as the backend sees it.
    fn now_millis(&self) -> u64;
}

#[async_trait]
impl RateLimiterBackend for SlidingWindowLimiter {
    async fn consume_token(&self, identifier: &str, rule_name: &str, cost: u32) -> Result<Decision> {
        SlidingWindowLimiter::consume_token(self, identifier, rule_name, cost).await
    }

    fn now_millis(&self) -> u64 {
        SlidingWindowLimiter::now_millis(self)
    }
}
