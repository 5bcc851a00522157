//! Rate limit rules and the registry that holds them.
//!
//! A rule names a limit, the sliding window it applies over and an optional
//! block duration imposed on identifiers that overflow it. The registry is an
//! explicit instance shared through `Arc`, so independently configured
//! limiters can coexist in one process.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use super::keys::validate_rule_name;
use crate::error::{GatekeeperError, Result};
use crate::store::duration_millis;

/// Rule for generic API traffic.
pub const API_CALLS: &str = "api-calls";
/// Rule for login attempts; blocks after overflow.
pub const AUTH_ATTEMPTS: &str = "auth-attempts";
/// Rule for password reset requests; blocks after overflow.
pub const PASSWORD_RESET: &str = "password-reset";

/// Longest window or block duration a rule may carry: 100 years.
pub const MAX_DURATION_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// The configurable part of a rule, as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Maximum number of events allowed per window
    pub limit: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// How long to block an identifier after it overflows, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_duration_ms: Option<u64>,
}

impl RuleConfig {
    /// A rule allowing `limit` events per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_ms: duration_millis(window),
            block_duration_ms: None,
        }
    }

    /// Block overflowing identifiers for `duration`.
    pub fn with_block(mut self, duration: Duration) -> Self {
        self.block_duration_ms = Some(duration_millis(duration));
        self
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(GatekeeperError::Validation(format!(
                "rule '{}': limit must be positive",
                name
            )));
        }
        if self.window_ms == 0 {
            return Err(GatekeeperError::Validation(format!(
                "rule '{}': window must be positive",
                name
            )));
        }
        if self.block_duration_ms == Some(0) {
            return Err(GatekeeperError::Validation(format!(
                "rule '{}': block duration must be positive when set",
                name
            )));
        }
        if self.window_ms > MAX_DURATION_MS
            || self.block_duration_ms.is_some_and(|ms| ms > MAX_DURATION_MS)
        {
            return Err(GatekeeperError::Validation(format!(
                "rule '{}': durations may not exceed {} ms",
                name, MAX_DURATION_MS
            )));
        }
        Ok(())
    }
}

/// A validated, named rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Rule name
    pub name: String,
    /// Maximum number of events allowed per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
    /// Block imposed after overflow, if any
    pub block_duration: Option<Duration>,
}

impl Rule {
    fn from_config(name: &str, config: RuleConfig) -> Self {
        Self {
            name: name.to_string(),
            limit: config.limit,
            window: Duration::from_millis(config.window_ms),
            block_duration: config.block_duration_ms.map(Duration::from_millis),
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        duration_millis(self.window)
    }

    /// The rule's configuration without its name.
    pub fn config(&self) -> RuleConfig {
        RuleConfig {
            limit: self.limit,
            window_ms: self.window_ms(),
            block_duration_ms: self.block_duration.map(duration_millis),
        }
    }
}

/// Registry of named rules.
///
/// Reads hand out owned copies; nothing a caller does with a returned rule
/// can reach the registry's state.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Rule>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in rules.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for (name, config) in default_rules() {
            registry.rules.write().insert(name.to_string(), Rule::from_config(name, config));
        }
        registry
    }

    /// Add or replace a rule.
    pub fn set_rule(&self, name: &str, config: RuleConfig) -> Result<Rule> {
        validate_rule_name(name)?;
        config.validate(name)?;

        let rule = Rule::from_config(name, config);
        let previous = self.rules.write().insert(name.to_string(), rule.clone());

        debug!(
            rule = %name,
            limit = config.limit,
            window_ms = config.window_ms,
            block_duration_ms = ?config.block_duration_ms,
            replaced = previous.is_some(),
            "Rule stored"
        );
        Ok(rule)
    }

    /// Look up a rule by name.
    pub fn get_rule(&self, name: &str) -> Result<Rule> {
        validate_rule_name(name)?;
        self.rules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatekeeperError::NotFound(format!("rule '{}' is not registered", name)))
    }

    /// All rules, ordered by name.
    pub fn list_rules(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// All rules as a name → configuration map.
    pub fn rules(&self) -> BTreeMap<String, RuleConfig> {
        self.rules
            .read()
            .iter()
            .map(|(name, rule)| (name.clone(), rule.config()))
            .collect()
    }

    /// Remove a rule.
    pub fn remove_rule(&self, name: &str) -> Result<Rule> {
        self.rules
            .write()
            .remove(name)
            .ok_or_else(|| GatekeeperError::NotFound(format!("rule '{}' is not registered", name)))
    }

    /// Apply a batch of rules, validating all of them before storing any.
    pub fn load(&self, rules: &BTreeMap<String, RuleConfig>) -> Result<()> {
        for (name, config) in rules {
            validate_rule_name(name)?;
            config.validate(name)?;
        }

        let mut table = self.rules.write();
        for (name, config) in rules {
            table.insert(name.clone(), Rule::from_config(name, *config));
        }
        info!(count = rules.len(), "Loaded rate limit rules");
        Ok(())
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

fn default_rules() -> [(&'static str, RuleConfig); 3] {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    [
        (API_CALLS, RuleConfig::new(100, Duration::from_secs(HOUR))),
        (
            AUTH_ATTEMPTS,
            RuleConfig::new(5, Duration::from_secs(15 * MINUTE))
                .with_block(Duration::from_secs(HOUR)),
        ),
        (
            PASSWORD_RESET,
            RuleConfig::new(3, Duration::from_secs(HOUR)).with_block(Duration::from_secs(HOUR)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let registry = RuleRegistry::with_defaults();

        let api = registry.get_rule(API_CALLS).unwrap();
        assert_eq!(api.limit, 100);
        assert_eq!(api.window, Duration::from_secs(3600));
        assert!(api.block_duration.is_none());

        let auth = registry.get_rule(AUTH_ATTEMPTS).unwrap();
        assert_eq!(auth.limit, 5);
        assert_eq!(auth.window_ms(), 900_000);
        assert_eq!(auth.block_duration, Some(Duration::from_secs(3600)));

        assert!(registry.get_rule(PASSWORD_RESET).is_ok());
    }

    #[test]
    fn test_set_rule_validates() {
        let registry = RuleRegistry::new();

        let err = registry
            .set_rule("", RuleConfig::new(1, Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::Validation(_)));

        let err = registry
            .set_rule("zero-limit", RuleConfig::new(0, Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::Validation(_)));

        let err = registry
            .set_rule("zero-window", RuleConfig::new(1, Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::Validation(_)));

        let err = registry
            .set_rule(
                "zero-block",
                RuleConfig::new(1, Duration::from_secs(1)).with_block(Duration::ZERO),
            )
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::Validation(_)));

        assert!(registry.is_empty());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let registry = RuleRegistry::new();
        let huge = RuleConfig {
            limit: 1,
            window_ms: u64::MAX,
            block_duration_ms: None,
        };
        let err = registry.set_rule("huge-window", huge).unwrap_err();
        assert!(matches!(err, GatekeeperError::Validation(_)));

        let err = registry
            .set_rule(
                "huge-block",
                RuleConfig::new(1, Duration::from_secs(1)).with_block(Duration::MAX),
            )
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::Validation(_)));

        let longest = RuleConfig::new(1, Duration::from_millis(MAX_DURATION_MS));
        assert!(registry.set_rule("century", longest).is_ok());
    }

    #[test]
    fn test_set_rule_overwrites() {
        let registry = RuleRegistry::new();
        registry
            .set_rule("search", RuleConfig::new(10, Duration::from_secs(60)))
            .unwrap();
        registry
            .set_rule("search", RuleConfig::new(20, Duration::from_secs(30)))
            .unwrap();

        let rule = registry.get_rule("search").unwrap();
        assert_eq!(rule.limit, 20);
        assert_eq!(rule.window, Duration::from_secs(30));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_rule_is_not_found() {
        let registry = RuleRegistry::new();
        let err = registry.get_rule("missing").unwrap_err();
        assert!(matches!(err, GatekeeperError::NotFound(_)));
    }

    #[test]
    fn test_returned_rules_are_copies() {
        let registry = RuleRegistry::with_defaults();

        let mut listed = registry.list_rules();
        for rule in &mut listed {
            rule.limit = 1;
            rule.block_duration = None;
        }
        let mut fetched = registry.get_rule(API_CALLS).unwrap();
        fetched.limit = 7;

        let mut map = registry.rules();
        map.clear();

        assert_eq!(registry.get_rule(API_CALLS).unwrap().limit, 100);
        assert_eq!(
            registry.get_rule(AUTH_ATTEMPTS).unwrap().block_duration,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(registry.rules().len(), 3);
    }

    #[test]
    fn test_list_rules_sorted() {
        let registry = RuleRegistry::with_defaults();
        let names: Vec<String> = registry.list_rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec![API_CALLS, AUTH_ATTEMPTS, PASSWORD_RESET]);
    }

    #[test]
    fn test_load_is_all_or_nothing() {
        let registry = RuleRegistry::new();
        let mut batch = BTreeMap::new();
        batch.insert("good".to_string(), RuleConfig::new(5, Duration::from_secs(1)));
        batch.insert("bad".to_string(), RuleConfig::new(0, Duration::from_secs(1)));

        assert!(registry.load(&batch).is_err());
        assert!(registry.is_empty());

        batch.remove("bad");
        registry.load(&batch).unwrap();
        assert_eq!(registry.get_rule("good").unwrap().limit, 5);
    }

    #[test]
    fn test_remove_rule() {
        let registry = RuleRegistry::with_defaults();
        registry.remove_rule(PASSWORD_RESET).unwrap();
        assert!(registry.get_rule(PASSWORD_RESET).is_err());
        assert!(matches!(
            registry.remove_rule(PASSWORD_RESET).unwrap_err(),
            GatekeeperError::NotFound(_)
        ));
    }

    #[test]
    fn test_rule_config_yaml() {
        let yaml = r#"
limit: 5
window_ms: 900000
block_duration_ms: 3600000
"#;
        let config: RuleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config,
            RuleConfig::new(5, Duration::from_secs(900)).with_block(Duration::from_secs(3600))
        );
    }
}
