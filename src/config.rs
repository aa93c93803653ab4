//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Algorithm;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Static defaults used when no per-principal config applies
    #[serde(default)]
    pub defaults: DefaultLimits,

    /// Rate parameters per named tier, e.g. free, premium or enterprise
    #[serde(default)]
    pub tiers: HashMap<String, TierLimits>,

    /// Bucket state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// What to do when the store cannot answer
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Path to a YAML file of per-principal rate limit configs
    #[serde(default)]
    pub configs_path: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Process-wide default rate limit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimits {
    /// Sustained requests per minute for principals without a config
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Algorithm used for synthesized configs
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            algorithm: Algorithm::default(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    10
}

/// Rate parameters shared by every principal in a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Sustained requests per minute
    pub requests_per_minute: u32,

    /// Maximum instantaneous bucket size; defaults to the sustained rate
    #[serde(default)]
    pub burst_capacity: Option<u32>,
}

impl TierLimits {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            burst_capacity: None,
        }
    }

    pub fn with_burst(mut self, burst_capacity: u32) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }
}

/// Which bucket store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, only correct for a single instance
    #[default]
    Memory,
    /// Redis shared by all instances
    Redis,
}

/// Bucket state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bucket TTL as a multiple of the refill window
    #[serde(default = "default_ttl_multiplier")]
    pub ttl_multiplier: u32,

    /// Optimistic commit attempts before giving up on a key
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// How often the in-memory store drops expired buckets, in milliseconds
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            ttl_multiplier: default_ttl_multiplier(),
            max_cas_attempts: default_max_cas_attempts(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// The store call timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The in-memory purge interval as a `Duration`.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_ttl_multiplier() -> u32 {
    2
}

fn default_max_cas_attempts() -> u32 {
    16
}

fn default_purge_interval_ms() -> u64 {
    60_000
}

/// Behaviour when the store times out or is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    FailOpen,
    /// Deny the request
    FailClosed,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration by layering built-in defaults, an optional YAML
    /// file and `TOLLGATE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&TollgateConfig::default())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            let name = path
                .to_str()
                .ok_or_else(|| TollgateError::Config(format!("non UTF-8 path: {}", path.display())))?;
            builder = builder.add_source(config::File::new(name, config::FileFormat::Yaml));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: TollgateConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.defaults.requests_per_minute == 0 {
            return Err(TollgateError::Config(
                "defaults.requests_per_minute must be positive".to_string(),
            ));
        }
        for (name, tier) in &self.tiers {
            if tier.requests_per_minute == 0 {
                return Err(TollgateError::Config(format!(
                    "tiers.{}.requests_per_minute must be positive",
                    name
                )));
            }
            if tier.burst_capacity == Some(0) {
                return Err(TollgateError::Config(format!(
                    "tiers.{}.burst_capacity must be positive",
                    name
                )));
            }
        }
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.ttl_multiplier == 0 {
            return Err(TollgateError::Config(
                "store.ttl_multiplier must be positive".to_string(),
            ));
        }
        if self.store.purge_interval_ms == 0 {
            return Err(TollgateError::Config(
                "store.purge_interval_ms must be positive".to_string(),
            ));
        }
        if self.store.max_cas_attempts == 0 {
            return Err(TollgateError::Config(
                "store.max_cas_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
