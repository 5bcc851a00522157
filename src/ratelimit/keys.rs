//! Store key naming.
//!
//! Counter keys are `<prefix><rule>:<identifier>` and block records are the
//! counter key plus the reserved `:blocked` suffix. Rule names never contain
//! `:`, so the first separator after the prefix always ends the rule name and
//! identifiers are free to contain colons (IPv6 addresses, `user:42`).

use crate::error::{GatekeeperError, Result};

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Suffix marking a block record.
pub const BLOCKED_SUFFIX: &str = ":blocked";

/// A key from the limiter's keyspace, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedKey {
    /// The rule the key belongs to
    pub rule: String,
    /// The limited identifier
    pub identifier: String,
    /// Whether this is a block record rather than a counter
    pub blocked: bool,
}

/// Builds and parses keys under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a keyspace rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Sorted-set key holding the sliding-window log.
    pub fn counter_key(&self, rule: &str, identifier: &str) -> String {
        format!("{}{}:{}", self.prefix, rule, identifier)
    }

    /// Scalar key holding a block record.
    pub fn block_key(&self, rule: &str, identifier: &str) -> String {
        format!("{}{}:{}{}", self.prefix, rule, identifier, BLOCKED_SUFFIX)
    }

    /// Scan pattern matching every key of one rule, block records included.
    pub fn rule_pattern(&self, rule: &str) -> String {
        format!("{}{}:*", escape_glob(&self.prefix), escape_glob(rule))
    }

    /// Scan pattern matching every key under the prefix.
    pub fn all_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.prefix))
    }

    /// Split a key back into rule, identifier and kind.
    ///
    /// Returns `None` for keys outside this keyspace.
    pub fn parse(&self, key: &str) -> Option<ParsedKey> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        let (rule, tail) = rest.split_once(':')?;
        let (identifier, blocked) = match tail.strip_suffix(BLOCKED_SUFFIX) {
            Some(identifier) => (identifier, true),
            None => (tail, false),
        };

        if rule.is_empty() || identifier.is_empty() {
            return None;
        }

        Some(ParsedKey {
            rule: rule.to_string(),
            identifier: identifier.to_string(),
            blocked,
        })
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Escape glob metacharacters so `value` only matches itself in a scan pattern.
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Reject rule names that are empty or would break key parsing.
pub fn validate_rule_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatekeeperError::Validation(
            "rule name is required".to_string(),
        ));
    }
    if name.contains(':') {
        return Err(GatekeeperError::Validation(format!(
            "rule name '{}' must not contain ':'",
            name
        )));
    }
    Ok(())
}

/// Reject identifiers that are empty or collide with block-record keys.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(GatekeeperError::Validation(
            "identifier is required".to_string(),
        ));
    }
    if identifier.ends_with(BLOCKED_SUFFIX) {
        return Err(GatekeeperError::Validation(format!(
            "identifier must not end with '{}'",
            BLOCKED_SUFFIX
        )));
    }
    Ok(())
}
