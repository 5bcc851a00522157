//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    AtomicExecutionStrategy, RuleConfig, RuleRegistry, DEFAULT_KEY_PREFIX, DEFAULT_MAX_ATTEMPTS,
};

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counting store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Background maintenance
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Rules merged over the built-in defaults
    #[serde(default)]
    pub rules: BTreeMap<String, RuleConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which atomic execution strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// One store-side script per admission
    #[default]
    Script,
    /// Read, then write only if the window is unchanged
    Optimistic,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Prefix for every key the limiter writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Atomic execution strategy
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Attempt budget for the optimistic strategy
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            strategy: StrategyKind::default(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl LimiterConfig {
    /// The configured strategy with its parameters.
    pub fn execution_strategy(&self) -> AtomicExecutionStrategy {
        match self.strategy {
            StrategyKind::Script => AtomicExecutionStrategy::ScriptBased,
            StrategyKind::Optimistic => AtomicExecutionStrategy::OptimisticRetry {
                max_attempts: self.max_attempts,
            },
        }
    }
}

/// Which counting store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; counters are not shared between instances
    #[default]
    Memory,
    /// Redis, shared by every instance pointing at it
    Redis,
}

/// Counting store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Per-command response timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_response_timeout() -> u64 {
    1000
}

impl StoreConfig {
    /// The response timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between cleanup passes; 0 disables the sweeper
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

impl SweeperConfig {
    /// The sweep interval, or `None` when disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl GatekeeperConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: GatekeeperConfig =
            serde_yaml::from_str(contents).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limiter.max_attempts == 0 {
            return Err(GatekeeperError::Config(
                "limiter.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.response_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "store.response_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a registry holding the built-in rules overlaid with the configured ones.
    pub fn rule_registry(&self) -> Result<RuleRegistry> {
        let registry = RuleRegistry::with_defaults();
        registry
            .load(&self.rules)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        Ok(registry)
    }
}
