//! Rate limiting logic and state management.

mod backend;
mod blocklist;
mod decision;
mod keys;
mod limiter;
mod rules;
mod stats;
mod strategy;
mod sweeper;

pub use backend::RateLimiterBackend;
pub use blocklist::BlockList;
pub use decision::{millis_to_datetime, Decision, ResetOutcome};
pub use keys::{KeySpace, ParsedKey, BLOCKED_SUFFIX, DEFAULT_KEY_PREFIX};
pub use limiter::SlidingWindowLimiter;
pub use rules::{
    Rule, RuleConfig, RuleRegistry, API_CALLS, AUTH_ATTEMPTS, MAX_DURATION_MS, PASSWORD_RESET,
};
pub use stats::{StatsOptions, StatsReport, TopUser, UsageReport, DEFAULT_TOP_USERS_LIMIT};
pub use strategy::{AtomicExecutionStrategy, DEFAULT_MAX_ATTEMPTS};
pub use sweeper::{CleanupReport, Sweeper};
