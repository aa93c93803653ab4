//! Rate limit configs and the provider they are looked up from.
//!
//! A config binds a (principal, resource) pair to a sustained rate and an
//! optional burst capacity. Configs are owned by an external admin surface;
//! the limiter only reads them through [`ConfigProvider`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use crate::config::TierLimits;
use crate::error::{Result, TollgateError};

const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// Admission algorithm named by a config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "TOKEN_BUCKET", alias = "token_bucket")]
    TokenBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "TOKEN_BUCKET",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective rate limit parameters for a (principal, resource) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub principal_id: String,
    pub resource: String,
    /// Named profile, e.g. free, premium or enterprise
    pub tier: String,
    /// Steady-state requests per minute; 0 takes the rate from the tier profile
    #[serde(default)]
    pub sustained_rate_per_minute: u32,
    /// Maximum instantaneous bucket size; defaults to the sustained rate
    #[serde(default)]
    pub burst_capacity: Option<u32>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitConfig {
    /// Create an enabled token bucket config without a burst override.
    pub fn new(principal_id: &str, resource: &str, tier: &str, sustained_rate_per_minute: u32) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            resource: resource.to_string(),
            tier: tier.to_string(),
            sustained_rate_per_minute,
            burst_capacity: None,
            algorithm: Algorithm::TokenBucket,
            enabled: true,
        }
    }

    /// Set the burst capacity.
    pub fn with_burst(mut self, burst_capacity: u32) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u32 {
        self.burst_capacity.unwrap_or(self.sustained_rate_per_minute)
    }

    /// Tokens added per elapsed millisecond.
    pub fn refill_rate_per_milli(&self) -> f64 {
        self.sustained_rate_per_minute as f64 / MILLIS_PER_MINUTE
    }

    /// Tokens earned over `elapsed_millis`, uncapped.
    pub fn tokens_refilled(&self, elapsed_millis: i64) -> f64 {
        if elapsed_millis <= 0 {
            return 0.0;
        }
        elapsed_millis as f64 * self.sustained_rate_per_minute as f64 / MILLIS_PER_MINUTE
    }

    /// Milliseconds needed to refill `tokens` tokens, rounded up.
    pub fn millis_to_refill(&self, tokens: f64) -> i64 {
        if tokens <= 0.0 {
            return 0;
        }
        (tokens * MILLIS_PER_MINUTE / self.sustained_rate_per_minute as f64).ceil() as i64
    }

    /// Time for an empty bucket to become full.
    pub fn refill_window_millis(&self) -> i64 {
        self.millis_to_refill(self.capacity() as f64)
    }

    /// Whether the rate parameters are left to the tier profile.
    pub fn inherits_tier_rate(&self) -> bool {
        self.sustained_rate_per_minute == 0
    }

    /// Fill rate parameters this config leaves open from a tier profile.
    /// An explicit burst capacity is kept.
    pub fn apply_tier(mut self, tier: &TierLimits) -> Self {
        if self.inherits_tier_rate() {
            self.sustained_rate_per_minute = tier.requests_per_minute;
            if self.burst_capacity.is_none() {
                self.burst_capacity = tier.burst_capacity;
            }
        }
        self
    }

    /// Check the config can be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.sustained_rate_per_minute == 0 {
            return Err(TollgateError::InvalidConfig(format!(
                "{}:{} has a sustained rate of 0",
                self.principal_id, self.resource
            )));
        }
        if self.burst_capacity == Some(0) {
            return Err(TollgateError::InvalidConfig(format!(
                "{}:{} has a burst capacity of 0",
                self.principal_id, self.resource
            )));
        }
        Ok(())
    }
}

/// Source of persisted per-principal configs.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Find the enabled config for an exact (principal, resource) pair.
    async fn find(&self, principal_id: &str, resource: &str) -> Result<Option<RateLimitConfig>>;
}

/// File layout accepted by [`InMemoryConfigProvider::from_yaml`].
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    configs: Vec<RateLimitConfig>,
}

/// A thread-safe config table with the admin operations needed to manage it.
#[derive(Debug, Default)]
pub struct InMemoryConfigProvider {
    configs: RwLock<HashMap<(String, String), RateLimitConfig>>,
}

impl InMemoryConfigProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configs from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configs");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configs from a YAML string.
    ///
    /// Accepts either a bare list of configs or a document with a `configs` key.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let configs = match serde_yaml::from_str::<Vec<RateLimitConfig>>(yaml) {
            Ok(configs) => configs,
            Err(_) => serde_yaml::from_str::<ConfigFile>(yaml)
                .map_err(|e| TollgateError::Config(format!("Failed to parse rate limit configs: {}", e)))?
                .configs,
        };

        let provider = Self::new();
        for config in configs {
            provider.upsert(config);
        }
        Ok(provider)
    }

    /// Insert or replace the config for its (principal, resource) pair.
    pub fn upsert(&self, config: RateLimitConfig) -> Option<RateLimitConfig> {
        debug!(
            principal = %config.principal_id,
            resource = %config.resource,
            tier = %config.tier,
            "Storing rate limit config"
        );
        let key = (config.principal_id.clone(), config.resource.clone());
        self.configs.write().insert(key, config)
    }

    /// Soft delete: keep the record but stop it from applying.
    pub fn disable(&self, principal_id: &str, resource: &str) -> bool {
        let mut configs = self.configs.write();
        match configs.get_mut(&(principal_id.to_string(), resource.to_string())) {
            Some(config) => {
                config.enabled = false;
                true
            }
            None => false,
        }
    }

    /// Remove a config entirely.
    pub fn remove(&self, principal_id: &str, resource: &str) -> Option<RateLimitConfig> {
        self.configs
            .write()
            .remove(&(principal_id.to_string(), resource.to_string()))
    }

    /// All enabled configs for a principal.
    pub fn list_for_principal(&self, principal_id: &str) -> Vec<RateLimitConfig> {
        self.configs
            .read()
            .values()
            .filter(|c| c.enabled && c.principal_id == principal_id)
            .cloned()
            .collect()
    }

    /// All enabled configs in a tier.
    pub fn list_by_tier(&self, tier: &str) -> Vec<RateLimitConfig> {
        self.configs
            .read()
            .values()
            .filter(|c| c.enabled && c.tier == tier)
            .cloned()
            .collect()
    }

    /// Number of stored configs, enabled or not.
    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }
}

#[async_trait]
impl ConfigProvider for InMemoryConfigProvider {
    async fn find(&self, principal_id: &str, resource: &str) -> Result<Option<RateLimitConfig>> {
        let configs = self.configs.read();
        Ok(configs
            .get(&(principal_id.to_string(), resource.to_string()))
            .filter(|c| c.enabled)
            .cloned())
    }
}
