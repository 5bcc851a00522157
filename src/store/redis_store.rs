//! Redis-backed counting store.
//!
//! Single commands map one-to-one onto Redis. The two atomic primitives run
//! as Lua scripts, which Redis executes without interleaving other commands.
//! Every round trip is bounded by the configured response timeout; nothing is
//! retried here, so an applied script is never replayed.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use tracing::info;

use super::{duration_millis, CountingStore, KeyTtl, SlidingWindowReply, SlidingWindowScript};
use crate::error::{GatekeeperError, Result};

/// ARGV: now, window, limit, cutoff, member...
const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[4])
local count = redis.call('ZCARD', key)
local cost = #ARGV - 4
local allowed = 0
if count + cost <= limit then
    for i = 5, #ARGV do
        redis.call('ZADD', key, ARGV[1], ARGV[i])
    end
    redis.call('PEXPIRE', key, ARGV[2])
    count = redis.call('ZCARD', key)
    allowed = 1
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if #oldest == 2 then
    oldest_score = tonumber(oldest[2])
end
return {allowed, count, oldest_score}
"#;

/// ARGV: expected cardinality, ttl, (score, member)...
const ZADD_IF_CARD_LUA: &str = r#"
local key = KEYS[1]
if redis.call('ZCARD', key) ~= tonumber(ARGV[1]) then
    return 0
end
for i = 3, #ARGV, 2 do
    redis.call('ZADD', key, ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', key, ARGV[2])
return 1
"#;

fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

/// A counting store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    response_timeout: Duration,
    sliding_window: Script,
    zadd_if_card: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`.
    ///
    /// The connection manager reconnects on its own after failures; commands
    /// issued while disconnected fail and surface as backend errors.
    pub async fn connect(url: &str, response_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = match tokio::time::timeout(response_timeout, ConnectionManager::new(client)).await
        {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(GatekeeperError::Backend(format!(
                    "connecting to redis timed out after {:?}",
                    response_timeout
                )))
            }
        };

        info!(timeout = ?response_timeout, "Connected to redis counting store");

        Ok(Self {
            conn,
            response_timeout,
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
            zadd_if_card: Script::new(ZADD_IF_CARD_LUA),
        })
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.response_timeout, fut).await {
            Ok(result) => result.map_err(GatekeeperError::from),
            Err(_) => Err(GatekeeperError::Backend(format!(
                "{} timed out after {:?}",
                op, self.response_timeout
            ))),
        }
    }
}

#[async_trait]
impl CountingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .timed("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let millis = duration_millis(ttl).max(1);
        let _: () = self
            .timed(
                "SET",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .timed("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await?;
        Ok(removed)
    }

    async fn zadd(&self, key: &str, entries: &[(String, f64)]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (member, score) in entries {
            cmd.arg(score_arg(*score)).arg(member);
        }

        let mut conn = self.conn.clone();
        let added: u64 = self.timed("ZADD", cmd.query_async(&mut conn)).await?;
        Ok(added)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .timed(
                "ZREMRANGEBYSCORE",
                redis::cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg(score_arg(min))
                    .arg(score_arg(max))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .timed("ZCARD", redis::cmd("ZCARD").arg(key).query_async(&mut conn))
            .await?;
        Ok(count)
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let members: Vec<(String, f64)> = self
            .timed(
                "ZRANGE",
                redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(start)
                    .arg(stop)
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;
        Ok(members)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        let page: (u64, Vec<String>) = self
            .timed(
                "SCAN",
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(page)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let millis: i64 = self
            .timed("PTTL", redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        match millis {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::Persistent),
            ms if ms >= 0 => Ok(KeyTtl::Expires(Duration::from_millis(ms as u64))),
            other => Err(GatekeeperError::Backend(format!(
                "unexpected PTTL reply {}",
                other
            ))),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let millis = duration_millis(ttl).max(1);
        let applied: i64 = self
            .timed(
                "PEXPIRE",
                redis::cmd("PEXPIRE").arg(key).arg(millis).query_async(&mut conn),
            )
            .await?;
        Ok(applied == 1)
    }

    async fn exec_sliding_window(&self, script: &SlidingWindowScript) -> Result<SlidingWindowReply> {
        let mut invocation = self.sliding_window.key(&script.key);
        invocation
            .arg(script.now_ms)
            .arg(script.window_ms.max(1))
            .arg(script.limit)
            .arg(script.cutoff());
        for member in &script.members {
            invocation.arg(member);
        }

        let mut conn = self.conn.clone();
        let (allowed, count, oldest): (i64, i64, i64) = self
            .timed("EVALSHA sliding_window", invocation.invoke_async(&mut conn))
            .await?;

        Ok(SlidingWindowReply {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            oldest_ms: (oldest >= 0).then_some(oldest as u64),
        })
    }

    async fn zadd_if_card(
        &self,
        key: &str,
        expected: u64,
        entries: &[(String, f64)],
        ttl: Duration,
    ) -> Result<bool> {
        let mut invocation = self.zadd_if_card.key(key);
        invocation
            .arg(expected)
            .arg(duration_millis(ttl).max(1));
        for (member, score) in entries {
            invocation.arg(score_arg(*score)).arg(member);
        }

        let mut conn = self.conn.clone();
        let written: i64 = self
            .timed("EVALSHA zadd_if_card", invocation.invoke_async(&mut conn))
            .await?;
        Ok(written == 1)
    }
}
