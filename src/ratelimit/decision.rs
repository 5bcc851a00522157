//! Admission decisions returned to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::rules::Rule;

/// Convert epoch milliseconds to a UTC timestamp, clamping past the end of
/// chrono's range.
pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The outcome of a limit check or token consumption. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the action may proceed
    pub allowed: bool,
    /// Events still available in the current window
    pub remaining: u32,
    /// The rule's limit
    pub limit: u32,
    /// Events recorded in the current window
    pub count: u64,
    /// When capacity frees up (or the block lifts)
    pub reset_at: DateTime<Utc>,
    /// Whether the identifier is blocked
    pub blocked: bool,
    /// Backend failure that forced a fail-open answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Decision {
    /// A denial caused by an active block.
    pub fn blocked(rule: &Rule, until_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit: rule.limit,
            count: 0,
            reset_at: millis_to_datetime(until_ms),
            blocked: true,
            error: None,
        }
    }

    /// The answer given when the store cannot be reached.
    pub fn fail_open(rule: &Rule, now_ms: u64, error: String) -> Self {
        Self {
            allowed: true,
            remaining: rule.limit,
            limit: rule.limit,
            count: 0,
            reset_at: millis_to_datetime(now_ms.saturating_add(rule.window_ms())),
            blocked: false,
            error: Some(error),
        }
    }

    /// Alias for [`Decision::allowed`] on the consuming path.
    pub fn success(&self) -> bool {
        self.allowed
    }

    /// How long a denied caller should wait, rounded up to whole seconds, at least one.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        let secs = millis.div_ceil(1000).max(1);
        Duration::from_secs(secs)
    }
}

/// Outcome of resetting an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    /// Whether the counter and block record were removed
    pub success: bool,
    /// Backend failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
