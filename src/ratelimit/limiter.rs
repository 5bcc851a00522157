//! Sliding-window rate limiter over a shared counting store.

use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::blocklist::BlockList;
use super::decision::{millis_to_datetime, Decision, ResetOutcome};
use super::keys::{validate_identifier, KeySpace};
use super::rules::{Rule, RuleRegistry};
use super::strategy::{oldest_score, prune_window, AtomicExecutionStrategy};
use crate::clock::{Clock, SystemClock};
use crate::error::{GatekeeperError, Result};
use crate::store::{CountingStore, SlidingWindowReply, SlidingWindowScript};

/// The rate limiter.
///
/// Every counter lives in the shared store, so any number of limiters in any
/// number of processes can point at the same store and agree on decisions.
/// This struct is cheap to share behind an `Arc`.
pub struct SlidingWindowLimiter {
    pub(crate) store: Arc<dyn CountingStore>,
    pub(crate) rules: Arc<RuleRegistry>,
    pub(crate) keys: KeySpace,
    strategy: AtomicExecutionStrategy,
    pub(crate) clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("keys", &self.keys)
            .field("strategy", &self.strategy)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter with the default key prefix, script-based atomicity
    /// and the system clock.
    pub fn new(store: Arc<dyn CountingStore>, rules: Arc<RuleRegistry>) -> Self {
        Self {
            store,
            rules,
            keys: KeySpace::default(),
            strategy: AtomicExecutionStrategy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys = KeySpace::new(prefix);
        self
    }

    /// Use a different atomic execution strategy.
    pub fn with_strategy(mut self, strategy: AtomicExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The rule registry this limiter reads.
    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    /// The keyspace this limiter writes.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// The configured atomic execution strategy.
    pub fn strategy(&self) -> AtomicExecutionStrategy {
        self.strategy
    }

    /// Current time according to the limiter's clock.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The block records kept alongside the counters.
    pub fn block_list(&self) -> BlockList<'_> {
        BlockList::new(self.store.as_ref(), &self.keys, self.clock.as_ref())
    }

    /// Validate inputs and fetch the rule they refer to.
    pub(crate) fn resolve(&self, identifier: &str, rule_name: &str) -> Result<Rule> {
        validate_identifier(identifier)?;
        self.rules.get_rule(rule_name)
    }

    /// Check whether `identifier` may act under `rule_name` without consuming anything.
    ///
    /// Only stale entries are removed from the store; repeated calls never
    /// change the remaining budget. Backend failures fail open.
    pub async fn check_limit(&self, identifier: &str, rule_name: &str) -> Result<Decision> {
        let rule = self.resolve(identifier, rule_name)?;
        let now = self.clock.now_millis();

        let outcome = self.peek(identifier, &rule, now).await;
        self.fail_open(outcome, &rule, identifier, now)
    }

    /// Record `cost` events for `identifier` under `rule_name` if they fit in the window.
    ///
    /// The prune, count and add happen as one atomic step. A denial on a rule
    /// with a block duration also blocks the identifier. Backend failures fail
    /// open.
    pub async fn consume_token(
        &self,
        identifier: &str,
        rule_name: &str,
        cost: u32,
    ) -> Result<Decision> {
        let rule = self.resolve(identifier, rule_name)?;
        if cost == 0 {
            return Err(GatekeeperError::Validation(
                "cost must be at least 1".to_string(),
            ));
        }
        let now = self.clock.now_millis();

        let outcome = self.consume(identifier, &rule, cost, now).await;
        self.fail_open(outcome, &rule, identifier, now)
    }

    /// Forget everything recorded for `identifier` under `rule_name`, including any block.
    pub async fn reset_limit(&self, identifier: &str, rule_name: &str) -> Result<ResetOutcome> {
        let rule = self.resolve(identifier, rule_name)?;
        let doomed = [
            self.keys.counter_key(&rule.name, identifier),
            self.keys.block_key(&rule.name, identifier),
        ];

        match self.store.del(&doomed).await {
            Ok(removed) => {
                debug!(
                    rule = %rule.name,
                    identifier = %identifier,
                    removed = removed,
                    "Rate limit reset"
                );
                Ok(ResetOutcome {
                    success: true,
                    error: None,
                })
            }
            Err(e) if e.is_backend() => {
                warn!(rule = %rule.name, identifier = %identifier, error = %e, "Reset failed");
                Ok(ResetOutcome {
                    success: false,
                    error: Some(e.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `identifier` is currently blocked under `rule_name`.
    pub async fn is_blocked(&self, identifier: &str, rule_name: &str) -> Result<bool> {
        let rule = self.resolve(identifier, rule_name)?;
        self.block_list().is_blocked(identifier, &rule.name).await
    }

    async fn peek(&self, identifier: &str, rule: &Rule, now: u64) -> Result<Decision> {
        if let Some(until) = self.block_list().blocked_until(identifier, &rule.name).await? {
            trace!(rule = %rule.name, identifier = %identifier, "Peek on blocked identifier");
            return Ok(Decision::blocked(rule, until));
        }

        let key = self.keys.counter_key(&rule.name, identifier);
        let (count, oldest) = self.window_usage(&key, rule, now).await?;

        trace!(key = %key, count = count, limit = rule.limit, "Checked rate limit");

        Ok(Decision {
            allowed: count < u64::from(rule.limit),
            remaining: remaining(rule, count),
            limit: rule.limit,
            count,
            reset_at: reset_at(rule, oldest, now),
            blocked: false,
            error: None,
        })
    }

    async fn consume(&self, identifier: &str, rule: &Rule, cost: u32, now: u64) -> Result<Decision> {
        let blocks = self.block_list();
        if let Some(until) = blocks.blocked_until(identifier, &rule.name).await? {
            trace!(rule = %rule.name, identifier = %identifier, "Consume on blocked identifier");
            return Ok(Decision::blocked(rule, until));
        }

        let key = self.keys.counter_key(&rule.name, identifier);
        let reply = if cost > rule.limit {
            // Can never fit; answer from the current window without minting tokens
            let (count, oldest_ms) = self.window_usage(&key, rule, now).await?;
            SlidingWindowReply {
                allowed: false,
                count,
                oldest_ms,
            }
        } else {
            let script = SlidingWindowScript {
                key: key.clone(),
                now_ms: now,
                window_ms: rule.window_ms(),
                limit: rule.limit,
                members: (0..cost).map(|_| event_token(now)).collect(),
            };
            self.strategy.execute(self.store.as_ref(), &script).await?
        };

        trace!(
            key = %key,
            cost = cost,
            allowed = reply.allowed,
            count = reply.count,
            "Consumed rate limit"
        );

        let mut decision = Decision {
            allowed: reply.allowed,
            remaining: remaining(rule, reply.count),
            limit: rule.limit,
            count: reply.count,
            reset_at: reset_at(rule, reply.oldest_ms, now),
            blocked: false,
            error: None,
        };

        if !reply.allowed {
            debug!(
                rule = %rule.name,
                identifier = %identifier,
                count = reply.count,
                limit = rule.limit,
                "Rate limit exceeded"
            );

            // Best effort: a lost block write only lets a few more requests through
            if let Some(duration) = rule.block_duration {
                match blocks.block(identifier, &rule.name, duration).await {
                    Ok(until) => {
                        decision.blocked = true;
                        decision.remaining = 0;
                        decision.reset_at = millis_to_datetime(until);
                    }
                    Err(e) => {
                        warn!(
                            rule = %rule.name,
                            identifier = %identifier,
                            error = %e,
                            "Failed to persist block record"
                        );
                    }
                }
            }
        }

        Ok(decision)
    }

    /// Prune the window at `key` and report its size and oldest score.
    pub(crate) async fn window_usage(
        &self,
        key: &str,
        rule: &Rule,
        now: u64,
    ) -> Result<(u64, Option<u64>)> {
        let store = self.store.as_ref();
        prune_window(store, key, now.saturating_sub(rule.window_ms())).await?;
        let count = store.zcard(key).await?;
        let oldest = if count > 0 {
            oldest_score(store, key).await?
        } else {
            None
        };
        Ok((count, oldest))
    }

    fn fail_open(
        &self,
        outcome: Result<Decision>,
        rule: &Rule,
        identifier: &str,
        now: u64,
    ) -> Result<Decision> {
        match outcome {
            Err(e) if e.is_backend() => {
                warn!(
                    rule = %rule.name,
                    identifier = %identifier,
                    error = %e,
                    "Counting store unavailable, failing open"
                );
                Ok(Decision::fail_open(rule, now, e.to_string()))
            }
            other => other,
        }
    }
}

fn remaining(rule: &Rule, count: u64) -> u32 {
    u64::from(rule.limit).saturating_sub(count) as u32
}

fn reset_at(rule: &Rule, oldest: Option<u64>, now: u64) -> chrono::DateTime<chrono::Utc> {
    millis_to_datetime(oldest.unwrap_or(now).saturating_add(rule.window_ms()))
}

fn event_token(now: u64) -> String {
    format!("{}-{}", now, Uuid::new_v4().simple())
}
