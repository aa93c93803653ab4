//! The rate limiter facade.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{FailurePolicy, StoreBackend, StoreConfig, TollgateConfig};
use crate::error::{Result, TollgateError};

use super::audit::{AuditEvent, AuditSink};
use super::bucket::{advance, Decision, DecisionMetadata};
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use super::resolver::ConfigResolver;
use super::rules::{InMemoryConfigProvider, RateLimitConfig};
use super::store::{BucketStore, MemoryBucketStore, RedisBucketStore};

/// Grants or denies requests against per-(principal, resource) token buckets.
///
/// The limiter keeps no bucket state of its own; every instance pointed at
/// the same store enforces the same quotas. It is cheap to share behind an
/// `Arc` across tasks.
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    resolver: ConfigResolver,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditSink>>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    ttl_multiplier: u32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("resolver", &self.resolver)
            .field("failure_policy", &self.failure_policy)
            .field("store_timeout", &self.store_timeout)
            .field("ttl_multiplier", &self.ttl_multiplier)
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter over a store and a config resolver.
    pub fn new(store: Arc<dyn BucketStore>, resolver: ConfigResolver) -> Self {
        let defaults = StoreConfig::default();
        Self {
            store,
            resolver,
            clock: Arc::new(SystemClock),
            audit: None,
            failure_policy: FailurePolicy::default(),
            store_timeout: defaults.timeout(),
            ttl_multiplier: defaults.ttl_multiplier,
        }
    }

    /// Build a rate limiter from service configuration.
    ///
    /// Connects to Redis when that backend is selected, otherwise starts the
    /// in-memory store's purge task. Loads the per-principal configs file
    /// when one is named.
    pub async fn from_config(config: &TollgateConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn BucketStore> = match config.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryBucketStore::new());
                store.spawn_purge_task(config.store.purge_interval());
                store
            }
            StoreBackend::Redis => {
                let connect = RedisBucketStore::connect(&config.store.redis_url, config.store.max_cas_attempts);
                let store = tokio::time::timeout(config.store.timeout(), connect)
                    .await
                    .map_err(|_| TollgateError::StoreTimeout(config.store.timeout()))??;
                Arc::new(store)
            }
        };

        let resolver = match &config.configs_path {
            Some(path) => {
                let provider = InMemoryConfigProvider::from_file(path)?;
                info!(count = provider.len(), "Loaded rate limit configs");
                ConfigResolver::new(Arc::new(provider), config.defaults.clone()).with_tiers(config.tiers.clone())
            }
            None => ConfigResolver::defaults_only(config.defaults.clone()),
        };

        Ok(Self::new(store, resolver)
            .with_failure_policy(config.failure_policy)
            .with_store_timeout(config.store.timeout())
            .with_ttl_multiplier(config.store.ttl_multiplier))
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit an audit event for every admission decision.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Set what happens when the store cannot answer.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Bound every store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Expire idle buckets after `multiplier` refill windows.
    pub fn with_ttl_multiplier(mut self, multiplier: u32) -> Self {
        self.ttl_multiplier = multiplier.max(1);
        self
    }

    /// Decide whether a request may proceed, consuming a token if it may.
    ///
    /// Never fails: store problems are turned into a decision by the
    /// configured failure policy.
    #[instrument(skip_all, fields(principal = %principal_id, resource = %resource))]
    pub async fn allow_request(&self, principal_id: &str, resource: &str) -> Decision {
        let started = Instant::now();
        let config = self.resolver.resolve(principal_id, resource).await;
        let key = BucketKey::new(principal_id, resource);
        let now = self.clock.now_millis();
        let ttl = self.bucket_ttl(&config);

        let consume = |state| advance(state, &config, now, true);
        let outcome = self
            .bounded(self.store.atomic_update(&key.to_store_key(), &consume, ttl))
            .await;

        let decision = match outcome {
            Ok(decision) => {
                if decision.allowed {
                    debug!(
                        key = %key,
                        tier = %decision.tier,
                        remaining = decision.remaining_tokens,
                        "Request allowed"
                    );
                } else {
                    warn!(
                        key = %key,
                        tier = %decision.tier,
                        reset_time_millis = decision.reset_time_millis,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.failure_decision(&config, now, true, &e),
        };

        self.record_audit(&config, &decision, started.elapsed());
        decision
    }

    /// Whole tokens left for a principal on a resource, without consuming any.
    pub async fn remaining_tokens(&self, principal_id: &str, resource: &str) -> i64 {
        self.status(principal_id, resource).await.remaining_tokens
    }

    /// Epoch milliseconds at which the bucket will next be full.
    pub async fn reset_time(&self, principal_id: &str, resource: &str) -> i64 {
        self.status(principal_id, resource).await.reset_time_millis
    }

    /// Project the bucket to now without consuming or persisting anything.
    #[instrument(skip_all, fields(principal = %principal_id, resource = %resource))]
    pub async fn status(&self, principal_id: &str, resource: &str) -> Decision {
        let config = self.resolver.resolve(principal_id, resource).await;
        let key = BucketKey::new(principal_id, resource);
        let now = self.clock.now_millis();

        let project = |state| advance(state, &config, now, false);
        match self.bounded(self.store.peek(&key.to_store_key(), &project)).await {
            Ok(decision) => {
                debug!(
                    key = %key,
                    remaining = decision.remaining_tokens,
                    reset_time_millis = decision.reset_time_millis,
                    "Bucket status"
                );
                decision
            }
            Err(e) => self.failure_decision(&config, now, false, &e),
        }
    }

    fn bucket_ttl(&self, config: &RateLimitConfig) -> Duration {
        let window = config.refill_window_millis().max(1) as u64;
        Duration::from_millis(window.saturating_mul(self.ttl_multiplier as u64))
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TollgateError::StoreTimeout(self.store_timeout)),
        }
    }

    /// Decision for a store call that produced no result.
    ///
    /// Outages and timeouts follow the failure policy. Anything else, such
    /// as a contended key, is denied: the store is up and admitting would
    /// let callers past a bucket that may already be empty.
    fn failure_decision(&self, config: &RateLimitConfig, now: i64, consume: bool, err: &TollgateError) -> Decision {
        let outage = err.is_store_failure();
        let allowed = outage && self.failure_policy == FailurePolicy::FailOpen;

        if outage {
            error!(
                principal = %config.principal_id,
                resource = %config.resource,
                error = %err,
                policy = ?self.failure_policy,
                "Bucket store failed, applying failure policy"
            );
        } else {
            warn!(
                principal = %config.principal_id,
                resource = %config.resource,
                error = %err,
                "Bucket update did not commit, denying request"
            );
        }

        let remaining_tokens = if allowed && !consume {
            config.capacity() as i64
        } else {
            0
        };

        let message = if !outage {
            format!("Rate limiter busy, request denied: {}", err)
        } else if allowed {
            format!("Rate limiter degraded, request allowed (fail-open): {}", err)
        } else {
            format!("Rate limiter degraded, request denied (fail-closed): {}", err)
        };

        Decision {
            allowed,
            remaining_tokens,
            reset_time_millis: now,
            tier: config.tier.clone(),
            message,
            metadata: DecisionMetadata {
                algorithm: config.algorithm,
                window_duration_seconds: (config.refill_window_millis() + 999) / 1000,
            },
        }
    }

    fn record_audit(&self, config: &RateLimitConfig, decision: &Decision, latency: Duration) {
        let Some(sink) = &self.audit else {
            return;
        };

        let event = AuditEvent::new(
            &config.principal_id,
            &config.resource,
            decision.allowed,
            decision.remaining_tokens,
            config.algorithm,
            latency.as_millis() as u64,
        );

        if let Err(e) = sink.record(event) {
            warn!(error = %e, "Failed to record audit event");
        }
    }
}
