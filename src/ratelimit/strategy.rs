//! Atomic execution of the sliding-window check-and-increment.
//!
//! Prune, count and conditional add must be indivisible relative to other
//! consumers of the same counter key, otherwise two callers can both observe
//! spare capacity and both increment. Either strategy below satisfies that.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use crate::error::{GatekeeperError, Result};
use crate::store::{CountingStore, SlidingWindowReply, SlidingWindowScript};

/// Default attempt budget for [`AtomicExecutionStrategy::OptimisticRetry`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Upper bound for the jittered pause between optimistic attempts.
const MAX_BACKOFF_MS: u64 = 64;

/// How the limiter obtains atomicity from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AtomicExecutionStrategy {
    /// The store runs the whole sequence server-side.
    ScriptBased,
    /// Read, then write conditionally on the observed cardinality; retry on conflict.
    OptimisticRetry {
        /// Attempts before giving up with a backend error
        max_attempts: u32,
    },
}

impl Default for AtomicExecutionStrategy {
    fn default() -> Self {
        AtomicExecutionStrategy::ScriptBased
    }
}

impl AtomicExecutionStrategy {
    /// Run one admission attempt against `store`.
    pub async fn execute(
        &self,
        store: &dyn CountingStore,
        script: &SlidingWindowScript,
    ) -> Result<SlidingWindowReply> {
        match *self {
            AtomicExecutionStrategy::ScriptBased => store.exec_sliding_window(script).await,
            AtomicExecutionStrategy::OptimisticRetry { max_attempts } => {
                optimistic(store, script, max_attempts.max(1)).await
            }
        }
    }
}

/// Drop members scored strictly below `cutoff_ms`.
pub(crate) async fn prune_window(store: &dyn CountingStore, key: &str, cutoff_ms: u64) -> Result<u64> {
    if cutoff_ms == 0 {
        return Ok(0);
    }
    // Scores are whole milliseconds
    store
        .zrem_range_by_score(key, f64::NEG_INFINITY, (cutoff_ms - 1) as f64)
        .await
}

/// Score of the oldest member, if any.
pub(crate) async fn oldest_score(store: &dyn CountingStore, key: &str) -> Result<Option<u64>> {
    let first = store.zrange_with_scores(key, 0, 0).await?;
    Ok(first.first().map(|(_, score)| *score as u64))
}

async fn optimistic(
    store: &dyn CountingStore,
    script: &SlidingWindowScript,
    max_attempts: u32,
) -> Result<SlidingWindowReply> {
    let ttl = Duration::from_millis(script.window_ms);
    let entries: Vec<(String, f64)> = script
        .members
        .iter()
        .map(|member| (member.clone(), script.now_ms as f64))
        .collect();

    for attempt in 0..max_attempts {
        prune_window(store, &script.key, script.cutoff()).await?;
        let count = store.zcard(&script.key).await?;

        if count + script.cost() > u64::from(script.limit) {
            return Ok(SlidingWindowReply {
                allowed: false,
                count,
                oldest_ms: oldest_score(store, &script.key).await?,
            });
        }

        // A concurrent prune can only shrink the window, so an unchanged
        // cardinality never hides extra admissions.
        if store.zadd_if_card(&script.key, count, &entries, ttl).await? {
            return Ok(SlidingWindowReply {
                allowed: true,
                count: count + script.cost(),
                oldest_ms: oldest_score(store, &script.key).await?,
            });
        }

        trace!(key = %script.key, attempt = attempt + 1, "Optimistic update conflicted");
        let delay = {
            let ceiling = (1u64 << attempt.min(6)).min(MAX_BACKOFF_MS);
            rand::thread_rng().gen_range(0..=ceiling)
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    Err(GatekeeperError::Backend(format!(
        "optimistic update of '{}' conflicted {} times",
        script.key, max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn script(key: &str, now_ms: u64, limit: u32, cost: usize) -> SlidingWindowScript {
        SlidingWindowScript {
            key: key.to_string(),
            now_ms,
            window_ms: 60_000,
            limit,
            members: (0..cost).map(|_| uuid::Uuid::new_v4().to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_both_strategies_agree() {
        for strategy in [
            AtomicExecutionStrategy::ScriptBased,
            AtomicExecutionStrategy::OptimisticRetry { max_attempts: 3 },
        ] {
            let store = MemoryStore::new();
            let now = 1_000_000;

            let reply = strategy.execute(&store, &script("k", now, 3, 2)).await.unwrap();
            assert!(reply.allowed, "{:?}", strategy);
            assert_eq!(reply.count, 2);
            assert_eq!(reply.oldest_ms, Some(now));

            let reply = strategy.execute(&store, &script("k", now, 3, 2)).await.unwrap();
            assert!(!reply.allowed, "{:?}", strategy);
            assert_eq!(reply.count, 2);

            let reply = strategy.execute(&store, &script("k", now, 3, 1)).await.unwrap();
            assert!(reply.allowed, "{:?}", strategy);
            assert_eq!(reply.count, 3);
        }
    }

    #[tokio::test]
    async fn test_concurrent_consumers_never_overshoot() {
        for strategy in [
            AtomicExecutionStrategy::ScriptBased,
            AtomicExecutionStrategy::OptimisticRetry { max_attempts: 200 },
        ] {
            let store = Arc::new(MemoryStore::new());
            let mut handles = Vec::new();
            for _ in 0..50 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    strategy
                        .execute(store.as_ref(), &script("shared", 5_000_000, 10, 1))
                        .await
                        .unwrap()
                        .allowed
                }));
            }

            let mut admitted = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 10, "{:?}", strategy);
            assert_eq!(store.zcard("shared").await.unwrap(), 10);
        }
    }

    /// Delegates to a memory store but reports a conflict on the first N conditional writes.
    struct ConflictingStore {
        inner: MemoryStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl CountingStore for ConflictingStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn del(&self, keys: &[String]) -> Result<u64> {
            self.inner.del(keys).await
        }
        async fn zadd(&self, key: &str, entries: &[(String, f64)]) -> Result<u64> {
            self.inner.zadd(key, entries).await
        }
        async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
            self.inner.zrem_range_by_score(key, min, max).await
        }
        async fn zcard(&self, key: &str) -> Result<u64> {
            self.inner.zcard(key).await
        }
        async fn zrange_with_scores(
            &self,
            key: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<(String, f64)>> {
            self.inner.zrange_with_scores(key, start, stop).await
        }
        async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
            self.inner.scan(cursor, pattern, count).await
        }
        async fn ttl(&self, key: &str) -> Result<crate::store::KeyTtl> {
            self.inner.ttl(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn exec_sliding_window(
            &self,
            script: &SlidingWindowScript,
        ) -> Result<SlidingWindowReply> {
            self.inner.exec_sliding_window(script).await
        }
        async fn zadd_if_card(
            &self,
            key: &str,
            expected: u64,
            entries: &[(String, f64)],
            ttl: Duration,
        ) -> Result<bool> {
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.zadd_if_card(key, expected, entries, ttl).await
        }
    }

    #[tokio::test]
    async fn test_optimistic_retries_after_conflict() {
        let store = ConflictingStore {
            inner: MemoryStore::new(),
            conflicts_left: AtomicU32::new(2),
        };
        let strategy = AtomicExecutionStrategy::OptimisticRetry { max_attempts: 3 };

        let reply = strategy.execute(&store, &script("k", 1_000, 5, 1)).await.unwrap();
        assert!(reply.allowed);
        assert_eq!(store.inner.zcard("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_optimistic_gives_up_after_budget() {
        let store = ConflictingStore {
            inner: MemoryStore::new(),
            conflicts_left: AtomicU32::new(10),
        };
        let strategy = AtomicExecutionStrategy::OptimisticRetry { max_attempts: 2 };

        let err = strategy.execute(&store, &script("k", 1_000, 5, 1)).await.unwrap_err();
        assert!(err.is_backend());
        assert_eq!(store.inner.zcard("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_window_keeps_boundary() {
        let store = MemoryStore::new();
        store
            .zadd(
                "k",
                &[
                    ("old".to_string(), 999.0),
                    ("edge".to_string(), 1_000.0),
                    ("new".to_string(), 1_500.0),
                ],
            )
            .await
            .unwrap();

        assert_eq!(prune_window(&store, "k", 1_000).await.unwrap(), 1);
        assert_eq!(store.zcard("k").await.unwrap(), 2);
        assert_eq!(oldest_score(&store, "k").await.unwrap(), Some(1_000));
        assert_eq!(prune_window(&store, "k", 0).await.unwrap(), 0);
    }
}
