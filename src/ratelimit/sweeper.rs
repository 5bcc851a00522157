//! Background repair of counter keys that lost their expiry.
//!
//! Every write path attaches a TTL, but a key can still end up persistent
//! (manual edits, an interrupted non-atomic write). Such keys would outlive
//! their window forever, so the sweeper periodically gives them one.

use futures::TryStreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::limiter::SlidingWindowLimiter;
use super::rules::Rule;
use crate::error::Result;
use crate::store::{scan_keys, KeyTtl, DEFAULT_SCAN_PAGE_SIZE};

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Keys that received an expiry
    pub cleaned: u64,
    /// Distinct keys examined
    pub scanned: u64,
    /// Backend failure that ended the pass early
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SlidingWindowLimiter {
    /// Attach an expiry to every counter key that has none.
    ///
    /// Block records and keys of unregistered rules are left alone, and
    /// nothing is ever deleted. Running it twice in a row cleans nothing the
    /// second time.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Err(e) = self.sweep(&mut report).await {
            warn!(error = %e, cleaned = report.cleaned, "Cleanup pass cut short");
            report.error = Some(e.to_string());
        }

        debug!(
            cleaned = report.cleaned,
            scanned = report.scanned,
            "Cleanup pass finished"
        );
        report
    }

    async fn sweep(&self, report: &mut CleanupReport) -> Result<()> {
        let store = self.store.as_ref();
        let mut keys = Box::pin(scan_keys(store, self.keys.all_pattern(), DEFAULT_SCAN_PAGE_SIZE));
        let mut seen = HashSet::new();
        let mut rules: HashMap<String, Option<Rule>> = HashMap::new();

        while let Some(key) = keys.try_next().await? {
            if !seen.insert(key.clone()) {
                continue;
            }
            report.scanned += 1;

            let Some(parsed) = self.keys.parse(&key) else {
                continue;
            };
            if parsed.blocked {
                continue;
            }

            let rule = rules
                .entry(parsed.rule)
                .or_insert_with_key(|name| self.rules.get_rule(name).ok());
            let Some(rule) = rule else {
                trace!(key = %key, "Skipping key of unregistered rule");
                continue;
            };

            if store.ttl(&key).await? == KeyTtl::Persistent && store.expire(&key, rule.window).await? {
                trace!(key = %key, window_ms = rule.window_ms(), "Attached missing expiry");
                report.cleaned += 1;
            }
        }
        Ok(())
    }
}

/// Runs [`SlidingWindowLimiter::cleanup`] on a fixed interval.
pub struct Sweeper {
    limiter: Arc<SlidingWindowLimiter>,
    interval: Duration,
}

impl Sweeper {
    /// Create a sweeper for `limiter` running every `interval`.
    pub fn new(limiter: Arc<SlidingWindowLimiter>, interval: Duration) -> Self {
        Self { limiter, interval }
    }

    /// Sweep until `shutdown` resolves. The first pass runs immediately.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(interval_secs = self.interval.as_secs_f64(), "Starting sweeper");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.limiter.cleanup().await;
                    if report.cleaned > 0 {
                        info!(cleaned = report.cleaned, scanned = report.scanned, "Repaired counter keys");
                    }
                }
            }
        }

        info!("Sweeper stopped");
    }
}
