//! Store doubles for tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CountingStore, MemoryStore, KeyTtl, SlidingWindowReply, SlidingWindowScript};
use crate::error::{GatekeeperError, Result};

fn refused<T>() -> Result<T> {
    Err(GatekeeperError::Backend("connection refused".to_string()))
}

/// A store whose every call fails as if the backend were down.
pub(crate) struct FailingStore;

#[async_trait]
impl CountingStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        refused()
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        refused()
    }

    async fn del(&self, _keys: &[String]) -> Result<u64> {
        refused()
    }

    async fn zadd(&self, _key: &str, _entries: &[(String, f64)]) -> Result<u64> {
        refused()
    }

    async fn zrem_range_by_score(&self, _key: &str, _min: f64, _max: f64) -> Result<u64> {
        refused()
    }

    async fn zcard(&self, _key: &str) -> Result<u64> {
        refused()
    }

    async fn zrange_with_scores(
        &self,
        _key: &str,
        _start: isize,
        _stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        refused()
    }

    async fn scan(&self, _cursor: u64, _pattern: &str, _count: usize) -> Result<(u64, Vec<String>)> {
        refused()
    }

    async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
        refused()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        refused()
    }

    async fn exec_sliding_window(&self, _script: &SlidingWindowScript) -> Result<SlidingWindowReply> {
        refused()
    }

    async fn zadd_if_card(
        &self,
        _key: &str,
        _expected: u64,
        _entries: &[(String, f64)],
        _ttl: Duration,
    ) -> Result<bool> {
        refused()
    }
}

/// A store that only answers scans, replaying fixed pages in order.
pub(crate) struct PagedStore {
    pages: Vec<Vec<String>>,
}

impl PagedStore {
    pub(crate) fn new(pages: Vec<Vec<String>>) -> Self {
        Self { pages }
    }
}

#[async_trait]
impl CountingStore for PagedStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _keys: &[String]) -> Result<u64> {
        Ok(0)
    }

    async fn zadd(&self, _key: &str, _entries: &[(String, f64)]) -> Result<u64> {
        Ok(0)
    }

    async fn zrem_range_by_score(&self, _key: &str, _min: f64, _max: f64) -> Result<u64> {
        Ok(0)
    }

    async fn zcard(&self, _key: &str) -> Result<u64> {
        Ok(0)
    }

    async fn zrange_with_scores(
        &self,
        _key: &str,
        _start: isize,
        _stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(Vec::new())
    }

    async fn scan(&self, cursor: u64, _pattern: &str, _count: usize) -> Result<(u64, Vec<String>)> {
        let index = cursor as usize;
        let page = self.pages.get(index).cloned().unwrap_or_default();
        let next = if index + 1 >= self.pages.len() {
            0
        } else {
            (index + 1) as u64
        };
        Ok((next, page))
    }

    async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
        Ok(KeyTtl::Missing)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        Ok(false)
    }

    async fn exec_sliding_window(&self, _script: &SlidingWindowScript) -> Result<SlidingWindowReply> {
        Ok(SlidingWindowReply {
            allowed: true,
            count: 0,
            oldest_ms: None,
        })
    }

    async fn zadd_if_card(
        &self,
        _key: &str,
        _expected: u64,
        _entries: &[(String, f64)],
        _ttl: Duration,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// A [`MemoryStore`] whose scans return one new key per page and repeat the
/// previous page alongside it, the way a Redis SCAN may during a rehash.
pub(crate) struct DuplicatingStore {
    inner: Arc<MemoryStore>,
    last_page: Mutex<Vec<String>>,
}

impl DuplicatingStore {
    pub(crate) fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            last_page: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CountingStore for DuplicatingStore {
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

    async fn scan(&self, cursor: u64, pattern: &str, _count: usize) -> Result<(u64, Vec<String>)> {
        let (next, page) = self.inner.scan(cursor, pattern, 1).await?;
        let mut last = self.last_page.lock();
        let mut keys = if cursor == 0 { Vec::new() } else { last.clone() };
        keys.extend(page.iter().cloned());
        *last = page;
        Ok((next, keys))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn exec_sliding_window(&self, script: &SlidingWindowScript) -> Result<SlidingWindowReply> {
        self.inner.exec_sliding_window(script).await
    }

    async fn zadd_if_card(
        &self,
        key: &str,
        expected: u64,
        entries: &[(String, f64)],
        ttl: Duration,
    ) -> Result<bool> {
        self.inner.zadd_if_card(key, expected, entries, ttl).await
    }
}
