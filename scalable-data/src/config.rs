//! Configuration for the data layer

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DataError, DataResult};

/// Rate limit class used when an operation class has no rule of its own
pub const DEFAULT_CLASS: &str = "default";

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Write batching configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// TTL for cached campaign statistics
    #[serde(default = "default_stats_ttl")]
    pub stats_ttl_seconds: u64,

    /// TTL for cached activity feeds
    #[serde(default = "default_activity_ttl")]
    pub activity_ttl_seconds: u64,
}

fn default_stats_ttl() -> u64 { 60 }
fn default_activity_ttl() -> u64 { 30 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            rate_limits: RateLimitConfig::default(),
            stats_ttl_seconds: 60,
            activity_ttl_seconds: 30,
        }
    }
}

impl ServiceConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> DataResult<Self> {
        let config: ServiceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> DataResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// Reject values that would make a component unusable
    pub fn validate(&self) -> DataResult<()> {
        if self.cache.max_entries == 0 {
            return Err(DataError::Config("cache.max_entries must be at least 1".into()));
        }
        if self.batch.batch_size == 0 {
            return Err(DataError::Config("batch.batch_size must be at least 1".into()));
        }
        if self.rate_limits.sweep_interval_ms == 0 {
            return Err(DataError::Config("rate_limits.sweep_interval_ms must be greater than zero".into()));
        }
        for (class, rule) in &self.rate_limits.rules {
            if rule.window_ms == 0 {
                return Err(DataError::Config(format!(
                    "rate_limits.rules.{}.window_ms must be greater than zero",
                    class
                )));
            }
        }
        Ok(())
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_seconds)
    }

    pub fn activity_ttl(&self) -> Duration {
        Duration::from_secs(self.activity_ttl_seconds)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default TTL in seconds
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,

    /// Maximum cache entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl() -> u64 { 300 }
fn default_max_entries() -> usize { 1000 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    /// Set max entries
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set default TTL
    pub fn with_ttl_seconds(mut self, seconds: u64) -> Self {
        self.default_ttl_seconds = seconds;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

/// Write batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Quiet period after the last enqueue before a timed flush
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
}

fn default_batch_size() -> usize { 50 }
fn default_batch_delay() -> u64 { 100 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay_ms: 100,
        }
    }
}

impl BatchConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_delay_ms(mut self, delay_ms: u64) -> Self {
        self.batch_delay_ms = delay_ms;
        self
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Request budget for one operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests admitted per window
    pub requests: u64,

    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitRule {
    pub fn new(requests: u64, window_ms: u64) -> Self {
        Self { requests, window_ms }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Rules by operation class
    #[serde(default = "default_rules")]
    pub rules: HashMap<String, RateLimitRule>,

    /// Subjects with no admission for this long are dropped by a sweep
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// How often the maintenance task sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_rules() -> HashMap<String, RateLimitRule> {
    HashMap::from([
        (DEFAULT_CLASS.to_string(), RateLimitRule::new(100, 60_000)),
        ("automation".to_string(), RateLimitRule::new(50, 60_000)),
        ("content".to_string(), RateLimitRule::new(20, 60_000)),
    ])
}
fn default_idle_timeout() -> u64 { 300_000 }
fn default_sweep_interval() -> u64 { 300_000 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            idle_timeout_ms: 300_000,
            sweep_interval_ms: 300_000,
        }
    }
}

impl RateLimitConfig {
    /// Add or replace the rule for an operation class
    pub fn with_rule(mut self, class: &str, rule: RateLimitRule) -> Self {
        self.rules.insert(class.to_string(), rule);
        self
    }

    pub fn with_idle_timeout_ms(mut self, idle_ms: u64) -> Self {
        self.idle_timeout_ms = idle_ms;
        self
    }

    /// Rule for a class, falling back to the `default` class
    pub fn rule_for(&self, class: &str) -> RateLimitRule {
        self.rules
            .get(class)
            .or_else(|| self.rules.get(DEFAULT_CLASS))
            .copied()
            .unwrap_or(RateLimitRule::new(100, 60_000))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
