//! Shared counting store abstraction.
//!
//! The limiter never talks to a concrete backend directly. Everything it
//! needs (scalar keys with expiry, per-key sorted sets, keyspace scanning and
//! an atomic multi-step primitive) goes through [`CountingStore`], so the same
//! limiter runs against an in-process [`MemoryStore`] or a shared Redis.

mod memory;
mod redis_store;
mod scan;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::scan::{scan_keys, DEFAULT_SCAN_PAGE_SIZE};

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key exists and expires after this long.
    Expires(Duration),
    /// The key exists and carries no expiry.
    Persistent,
    /// The key does not exist.
    Missing,
}

/// One sliding-window admission attempt, executed atomically by the store.
///
/// The store must, as one indivisible step:
/// 1. drop every member of `key` scored below `now_ms - window_ms`,
/// 2. count what is left,
/// 3. if `count + members.len() <= limit`, add every member scored `now_ms`
///    and set the key's expiry to `window_ms`.
#[derive(Debug, Clone)]
pub struct SlidingWindowScript {
    /// Counter key
    pub key: String,
    /// Current time in epoch milliseconds
    pub now_ms: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum number of members allowed in the window
    pub limit: u32,
    /// Unique event tokens to add, one per unit of cost
    pub members: Vec<String>,
}

impl SlidingWindowScript {
    /// Scores strictly below this value fall outside the window.
    pub fn cutoff(&self) -> u64 {
        self.now_ms.saturating_sub(self.window_ms)
    }

    /// The number of units this attempt consumes.
    pub fn cost(&self) -> u64 {
        self.members.len() as u64
    }
}

/// Outcome of a [`SlidingWindowScript`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowReply {
    /// Whether the members were added
    pub allowed: bool,
    /// Members in the window after the attempt
    pub count: u64,
    /// Score of the oldest member still in the window
    pub oldest_ms: Option<u64>,
}

/// Primitives the limiter requires from the shared store.
///
/// Implementations must be safe to call from many tasks at once. Only
/// [`CountingStore::exec_sliding_window`] and [`CountingStore::zadd_if_card`]
/// carry an atomicity requirement; every other call is a single store command.
#[async_trait]
pub trait CountingStore: Send + Sync {
    /// Read a scalar key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a scalar key with an expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Add members to a sorted set, returning how many were new.
    async fn zadd(&self, key: &str, entries: &[(String, f64)]) -> Result<u64>;

    /// Remove members scored within `[min, max]`, returning how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// Number of members in a sorted set (0 if absent).
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Members by ascending score rank, inclusive, negative indices counting from the end.
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;

    /// One page of a keyspace scan. A returned cursor of 0 means the scan is complete.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Attach an expiry to an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Execute a sliding-window admission attempt atomically on the store side.
    async fn exec_sliding_window(&self, script: &SlidingWindowScript) -> Result<SlidingWindowReply>;

    /// Add members and set the expiry only if the set still holds `expected` members.
    ///
    /// This is the conditional write behind optimistic concurrency. Returns
    /// `false` without writing anything on a mismatch.
    async fn zadd_if_card(
        &self,
        key: &str,
        expected: u64,
        entries: &[(String, f64)],
        ttl: Duration,
    ) -> Result<bool>;
}
