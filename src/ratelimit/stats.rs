//! Usage reporting for single identifiers and whole rules.
//!
//! Reports are read-mostly snapshots. They prune stale entries as they go but
//! never consume, and backend failures produce a report carrying `error`
//! instead of an `Err`.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::decision::millis_to_datetime;
use super::limiter::SlidingWindowLimiter;
use super::rules::Rule;
use crate::error::Result;
use crate::store::{scan_keys, DEFAULT_SCAN_PAGE_SIZE};

/// Default number of identifiers listed in [`StatsReport::top_users`].
pub const DEFAULT_TOP_USERS_LIMIT: usize = 10;

/// Usage of one identifier under one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    /// The identifier
    pub identifier: String,
    /// The rule
    pub rule: String,
    /// Events recorded in the current window
    pub used: u64,
    /// The rule's limit
    pub limit: u32,
    /// Events still available
    pub remaining: u32,
    /// `used` as a percentage of `limit`
    pub percentage: f64,
    /// Whether the identifier is blocked
    pub blocked: bool,
    /// When the block lifts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_expiry: Option<DateTime<Utc>>,
    /// Backend failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for [`SlidingWindowLimiter::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsOptions {
    /// How many of the busiest identifiers to list
    #[serde(default = "default_top_users_limit", alias = "top")]
    pub top_users_limit: usize,
}

fn default_top_users_limit() -> usize {
    DEFAULT_TOP_USERS_LIMIT
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            top_users_limit: DEFAULT_TOP_USERS_LIMIT,
        }
    }
}

/// One entry of [`StatsReport::top_users`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopUser {
    /// The identifier
    pub identifier: String,
    /// Events recorded in the current window
    pub count: u64,
    /// `count` as a percentage of the limit
    pub percentage: f64,
}

/// Aggregate usage of one rule across all identifiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    /// The rule
    pub rule: String,
    /// The rule's limit
    pub limit: u32,
    /// The rule's window in milliseconds
    pub window_ms: u64,
    /// Identifiers with at least one event in the window
    pub total_identifiers: u64,
    /// Identifiers currently blocked
    pub blocked_count: u64,
    /// Events across all identifiers
    pub total_requests: u64,
    /// Mean events per identifier
    pub average_usage: f64,
    /// Busiest identifiers, descending by count
    pub top_users: Vec<TopUser>,
    /// Backend failure that cut the report short
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatsReport {
    fn empty(rule: &Rule) -> Self {
        Self {
            rule: rule.name.clone(),
            limit: rule.limit,
            window_ms: rule.window_ms(),
            total_identifiers: 0,
            blocked_count: 0,
            total_requests: 0,
            average_usage: 0.0,
            top_users: Vec::new(),
            error: None,
        }
    }
}

fn percentage(count: u64, limit: u32) -> f64 {
    count as f64 / f64::from(limit) * 100.0
}

impl SlidingWindowLimiter {
    /// Report how much of `rule_name` the identifier has used.
    pub async fn get_usage(&self, identifier: &str, rule_name: &str) -> Result<UsageReport> {
        let rule = self.resolve(identifier, rule_name)?;
        let now = self.now_millis();
        let key = self.keys.counter_key(&rule.name, identifier);

        let outcome = async {
            let (used, _) = self.window_usage(&key, &rule, now).await?;
            let until = self.block_list().blocked_until(identifier, &rule.name).await?;
            Ok::<_, crate::error::GatekeeperError>((used, until))
        }
        .await;

        let mut report = UsageReport {
            identifier: identifier.to_string(),
            rule: rule.name.clone(),
            used: 0,
            limit: rule.limit,
            remaining: rule.limit,
            percentage: 0.0,
            blocked: false,
            block_expiry: None,
            error: None,
        };

        match outcome {
            Ok((used, until)) => {
                report.used = used;
                report.remaining = u64::from(rule.limit).saturating_sub(used) as u32;
                report.percentage = percentage(used, rule.limit);
                report.blocked = until.is_some();
                report.block_expiry = until.map(millis_to_datetime);
            }
            Err(e) if e.is_backend() => {
                warn!(rule = %rule.name, identifier = %identifier, error = %e, "Usage lookup failed");
                report.error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        Ok(report)
    }

    /// Summarize usage of `rule_name` across every identifier in the store.
    pub async fn get_stats(&self, rule_name: &str, options: StatsOptions) -> Result<StatsReport> {
        let rule = self.rules.get_rule(rule_name)?;
        let mut report = StatsReport::empty(&rule);
        let mut users = Vec::new();

        if let Err(e) = self.collect_stats(&rule, &mut report, &mut users).await {
            if !e.is_backend() {
                return Err(e);
            }
            warn!(rule = %rule.name, error = %e, "Stats collection cut short");
            report.error = Some(e.to_string());
        }

        report.total_identifiers = users.len() as u64;
        report.total_requests = users.iter().map(|user: &TopUser| user.count).sum();
        if !users.is_empty() {
            report.average_usage = report.total_requests as f64 / users.len() as f64;
        }

        users.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.identifier.cmp(&b.identifier)));
        users.truncate(options.top_users_limit);
        report.top_users = users;

        debug!(
            rule = %rule.name,
            identifiers = report.total_identifiers,
            blocked = report.blocked_count,
            requests = report.total_requests,
            "Collected rule stats"
        );
        Ok(report)
    }

    async fn collect_stats(
        &self,
        rule: &Rule,
        report: &mut StatsReport,
        users: &mut Vec<TopUser>,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let now = self.now_millis();
        let mut keys = Box::pin(scan_keys(
            store,
            self.keys.rule_pattern(&rule.name),
            DEFAULT_SCAN_PAGE_SIZE,
        ));
        let mut seen = HashSet::new();

        while let Some(key) = keys.try_next().await? {
            if !seen.insert(key.clone()) {
                continue;
            }
            let Some(parsed) = self.keys.parse(&key) else {
                continue;
            };
            if parsed.rule != rule.name {
                continue;
            }
            if parsed.blocked {
                report.blocked_count += 1;
                continue;
            }

            let (count, _) = self.window_usage(&key, rule, now).await?;
            if count == 0 {
                continue;
            }
            users.push(TopUser {
                identifier: parsed.identifier,
                count,
                percentage: percentage(count, rule.limit),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::GatekeeperError;
    use crate::ratelimit::rules::{RuleConfig, RuleRegistry, API_CALLS, AUTH_ATTEMPTS};
    use crate::store::testing::{DuplicatingStore, FailingStore};
    use crate::store::{CountingStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = SlidingWindowLimiter::new(store.clone(), Arc::new(RuleRegistry::with_defaults()))
            .with_clock(clock.clone());
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn test_usage_after_reset() {
        let (_clock, _store, limiter) = limiter();

        limiter.consume_token("u1", API_CALLS, 25).await.unwrap();
        let usage = limiter.get_usage("u1", API_CALLS).await.unwrap();
        assert_eq!(usage.used, 25);
        assert_eq!(usage.remaining, 75);
        assert_eq!(usage.percentage, 25.0);
        assert!(!usage.blocked);

        limiter.reset_limit("u1", API_CALLS).await.unwrap();
        let usage = limiter.get_usage("u1", API_CALLS).await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 100);
        assert_eq!(usage.percentage, 0.0);
    }

    #[tokio::test]
    async fn test_usage_reports_block() {
        let (_clock, _store, limiter) = limiter();

        for _ in 0..6 {
            limiter.consume_token("u2", AUTH_ATTEMPTS, 1).await.unwrap();
        }
        let usage = limiter.get_usage("u2", AUTH_ATTEMPTS).await.unwrap();
        assert!(usage.blocked);
        assert_eq!(usage.used, 5);
        assert_eq!(
            usage.block_expiry,
            Some(millis_to_datetime(limiter.now_millis() + 3_600_000))
        );
    }

    #[tokio::test]
    async fn test_usage_fails_open() {
        let limiter = SlidingWindowLimiter::new(
            Arc::new(FailingStore),
            Arc::new(RuleRegistry::with_defaults()),
        );

        let usage = limiter.get_usage("u1", API_CALLS).await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 100);
        assert!(usage.error.is_some());

        let err = limiter.get_usage("u1", "missing").await.unwrap_err();
        assert!(matches!(err, GatekeeperError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stats_empty_rule() {
        let (_clock, _store, limiter) = limiter();

        let stats = limiter.get_stats(API_CALLS, StatsOptions::default()).await.unwrap();
        assert_eq!(stats.total_identifiers, 0);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.average_usage, 0.0);
        assert!(stats.top_users.is_empty());
        assert!(stats.error.is_none());
    }

    #[tokio::test]
    async fn test_stats_ranks_identifiers() {
        let (_clock, _store, limiter) = limiter();

        limiter.consume_token("light", API_CALLS, 2).await.unwrap();
        limiter.consume_token("heavy", API_CALLS, 50).await.unwrap();
        limiter.consume_token("medium", API_CALLS, 10).await.unwrap();
        limiter.consume_token("elsewhere", AUTH_ATTEMPTS, 1).await.unwrap();

        let stats = limiter
            .get_stats(API_CALLS, StatsOptions { top_users_limit: 2 })
            .await
            .unwrap();

        assert_eq!(stats.total_identifiers, 3);
        assert_eq!(stats.total_requests, 62);
        assert!((stats.average_usage - 62.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.top_users.len(), 2);
        assert_eq!(stats.top_users[0].identifier, "heavy");
        assert_eq!(stats.top_users[0].percentage, 50.0);
        assert_eq!(stats.top_users[1].identifier, "medium");
    }

    #[tokio::test]
    async fn test_stats_counts_blocks_separately() {
        let (_clock, _store, limiter) = limiter();

        for _ in 0..6 {
            limiter.consume_token("attacker", AUTH_ATTEMPTS, 1).await.unwrap();
        }
        limiter.consume_token("user", AUTH_ATTEMPTS, 1).await.unwrap();

        let stats = limiter
            .get_stats(AUTH_ATTEMPTS, StatsOptions::default())
            .await
            .unwrap();
        assert_eq!(stats.blocked_count, 1);
        assert_eq!(stats.total_identifiers, 2);
        assert_eq!(stats.total_requests, 6);
    }

    #[tokio::test]
    async fn test_stats_skip_expired_windows() {
        let (clock, store, limiter) = limiter();
        limiter
            .rules()
            .set_rule("short", RuleConfig::new(10, Duration::from_secs(1)))
            .unwrap();

        // Persistent members, so only pruning can hide them
        let key = limiter.keys().counter_key("short", "stale");
        store
            .zadd(&key, &[("e".to_string(), limiter.now_millis() as f64)])
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        limiter.consume_token("fresh", "short", 1).await.unwrap();

        let stats = limiter.get_stats("short", StatsOptions::default()).await.unwrap();
        assert_eq!(stats.total_identifiers, 1);
        assert_eq!(stats.top_users[0].identifier, "fresh");
    }

    #[tokio::test]
    async fn test_stats_ignore_repeated_scan_keys() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let inner = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = SlidingWindowLimiter::new(
            Arc::new(DuplicatingStore::new(inner)),
            Arc::new(RuleRegistry::with_defaults()),
        )
        .with_clock(clock);

        for _ in 0..6 {
            limiter.consume_token("attacker", AUTH_ATTEMPTS, 1).await.unwrap();
        }
        limiter.consume_token("user1", AUTH_ATTEMPTS, 2).await.unwrap();
        limiter.consume_token("user2", AUTH_ATTEMPTS, 1).await.unwrap();

        let stats = limiter
            .get_stats(AUTH_ATTEMPTS, StatsOptions::default())
            .await
            .unwrap();
        assert_eq!(stats.total_identifiers, 3);
        assert_eq!(stats.total_requests, 8);
        assert_eq!(stats.blocked_count, 1);
        let counts: Vec<(String, u64)> = stats
            .top_users
            .iter()
            .map(|user| (user.identifier.clone(), user.count))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("attacker".to_string(), 5),
                ("user1".to_string(), 2),
                ("user2".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_stats_fail_open() {
        let limiter = SlidingWindowLimiter::new(
            Arc::new(FailingStore),
            Arc::new(RuleRegistry::with_defaults()),
        );

        let stats = limiter.get_stats(API_CALLS, StatsOptions::default()).await.unwrap();
        assert_eq!(stats.total_identifiers, 0);
        assert!(stats.error.is_some());

        assert!(limiter.get_stats("missing", StatsOptions::default()).await.is_err());
    }
}
