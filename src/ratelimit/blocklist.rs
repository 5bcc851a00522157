//! Temporary bans for identifiers that overflow a blocking rule.
//!
//! A block record is a scalar key whose value is the expiry in epoch
//! milliseconds and whose store TTL equals the block duration, so the record
//! disappears on its own when the block lifts.

use std::time::Duration;
use tracing::debug;

use super::keys::KeySpace;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::{duration_millis, CountingStore, KeyTtl};

/// A view over the block-record keyspace.
pub struct BlockList<'a> {
    store: &'a dyn CountingStore,
    keys: &'a KeySpace,
    clock: &'a dyn Clock,
}

impl<'a> BlockList<'a> {
    /// Create a view over `store` using `keys` for naming.
    pub fn new(store: &'a dyn CountingStore, keys: &'a KeySpace, clock: &'a dyn Clock) -> Self {
        Self { store, keys, clock }
    }

    /// When the block on `identifier` lifts, or `None` if it is not blocked.
    pub async fn blocked_until(&self, identifier: &str, rule: &str) -> Result<Option<u64>> {
        let key = self.keys.block_key(rule, identifier);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let now = self.clock.now_millis();
        let until = match value.parse::<u64>() {
            Ok(until) => until,
            // Unreadable value: trust the store's TTL instead
            Err(_) => match self.store.ttl(&key).await? {
                KeyTtl::Expires(left) => now.saturating_add(duration_millis(left)),
                KeyTtl::Persistent => u64::MAX,
                KeyTtl::Missing => return Ok(None),
            },
        };

        Ok((until > now).then_some(until))
    }

    /// Whether `identifier` is currently blocked under `rule`.
    pub async fn is_blocked(&self, identifier: &str, rule: &str) -> Result<bool> {
        Ok(self.blocked_until(identifier, rule).await?.is_some())
    }

    /// Block `identifier` for `duration`, replacing any existing block.
    ///
    /// Returns the expiry in epoch milliseconds.
    pub async fn block(&self, identifier: &str, rule: &str, duration: Duration) -> Result<u64> {
        let key = self.keys.block_key(rule, identifier);
        let until = self.clock.now_millis().saturating_add(duration_millis(duration));
        self.store.set_ex(&key, &until.to_string(), duration).await?;

        debug!(
            rule = %rule,
            identifier = %identifier,
            until_ms = until,
            "Identifier blocked"
        );
        Ok(until)
    }

    /// Lift a block. Returns whether one existed.
    pub async fn clear_block(&self, identifier: &str, rule: &str) -> Result<bool> {
        let key = self.keys.block_key(rule, identifier);
        Ok(self.store.del(&[key]).await? > 0)
    }
}
