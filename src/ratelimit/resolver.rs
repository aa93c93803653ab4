//! Resolution of the effective config for a (principal, resource) pair.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{DefaultLimits, TierLimits};
use crate::error::Result;

use super::rules::{ConfigProvider, RateLimitConfig};

/// Tier reported for synthesized configs.
pub const DEFAULT_TIER: &str = "default";

/// Resolves configs with a fixed fallback chain: persisted config, then the
/// profile of its tier for any rate it leaves open, then the static defaults.
/// Resolution never fails.
#[derive(Clone)]
pub struct ConfigResolver {
    provider: Option<Arc<dyn ConfigProvider>>,
    tiers: HashMap<String, TierLimits>,
    defaults: DefaultLimits,
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("has_provider", &self.provider.is_some())
            .field("tiers", &self.tiers.len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl ConfigResolver {
    /// Create a resolver backed by a config provider.
    pub fn new(provider: Arc<dyn ConfigProvider>, defaults: DefaultLimits) -> Self {
        Self {
            provider: Some(provider),
            tiers: HashMap::new(),
            defaults,
        }
    }

    /// Create a resolver that always returns the defaults.
    pub fn defaults_only(defaults: DefaultLimits) -> Self {
        Self {
            provider: None,
            tiers: HashMap::new(),
            defaults,
        }
    }

    /// Use tier profiles for configs that do not set their own rate.
    pub fn with_tiers(mut self, tiers: HashMap<String, TierLimits>) -> Self {
        self.tiers = tiers;
        self
    }

    /// The static defaults used on fallback.
    pub fn defaults(&self) -> &DefaultLimits {
        &self.defaults
    }

    /// Resolve the config that applies to `principal_id` on `resource`.
    pub async fn resolve(&self, principal_id: &str, resource: &str) -> RateLimitConfig {
        let Some(provider) = &self.provider else {
            return self.default_config(principal_id, resource);
        };

        match provider.find(principal_id, resource).await {
            Ok(Some(config)) if !config.enabled => {
                debug!(
                    principal = %principal_id,
                    resource = %resource,
                    "Config is disabled, using defaults"
                );
            }
            Ok(Some(config)) => match self.apply_tier(config) {
                Ok(config) => {
                    debug!(
                        principal = %principal_id,
                        resource = %resource,
                        tier = %config.tier,
                        capacity = config.capacity(),
                        "Resolved persisted config"
                    );
                    return config;
                }
                Err(e) => {
                    warn!(
                        principal = %principal_id,
                        resource = %resource,
                        error = %e,
                        "Rejecting invalid config, using defaults"
                    );
                }
            },
            Ok(None) => {
                debug!(
                    principal = %principal_id,
                    resource = %resource,
                    "No config found, using defaults"
                );
            }
            Err(e) => {
                warn!(
                    principal = %principal_id,
                    resource = %resource,
                    error = %e,
                    "Config lookup failed, using defaults"
                );
            }
        }

        self.default_config(principal_id, resource)
    }

    /// Fill an open rate from the config's tier profile, then validate.
    fn apply_tier(&self, config: RateLimitConfig) -> Result<RateLimitConfig> {
        let config = match self.tiers.get(&config.tier) {
            Some(tier) => config.apply_tier(tier),
            None => config,
        };
        config.validate()?;
        Ok(config)
    }

    fn default_config(&self, principal_id: &str, resource: &str) -> RateLimitConfig {
        RateLimitConfig {
            principal_id: principal_id.to_string(),
            resource: resource.to_string(),
            tier: DEFAULT_TIER.to_string(),
            sustained_rate_per_minute: self.defaults.requests_per_minute,
            burst_capacity: None,
            algorithm: self.defaults.algorithm,
            enabled: true,
        }
    }
}
