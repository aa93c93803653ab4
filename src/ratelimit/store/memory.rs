//! In-process bucket store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BucketStore, UpdateFn};
use crate::error::Result;
use crate::ratelimit::bucket::{BucketState, Decision};

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: Instant,
}

impl StoredBucket {
    fn live_state(&self, now: Instant) -> Option<BucketState> {
        (self.expires_at > now).then_some(self.state)
    }
}

/// Bucket store backed by a sharded concurrent map.
///
/// The update function runs while the key's shard is write-locked, which
/// linearizes updates per key. State lives in this process only, so it is
/// correct for a single instance; multiple instances need a shared store.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, StoredBucket>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored buckets, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop expired buckets. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        before.saturating_sub(self.buckets.len())
    }

    /// Purge expired buckets every `every` on a background task.
    ///
    /// The task holds a weak reference and stops once the store is dropped.
    pub fn spawn_purge_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Bucket store dropped, stopping purge task");
                    return;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired buckets");
                }
            }
        })
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn atomic_update(&self, key: &str, update: UpdateFn<'_>, ttl: Duration) -> Result<Decision> {
        let now = Instant::now();

        let decision = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().live_state(now);
                let (state, decision) = update(current);
                occupied.insert(StoredBucket {
                    state,
                    expires_at: now + ttl,
                });
                decision
            }
            Entry::Vacant(vacant) => {
                let (state, decision) = update(None);
                vacant.insert(StoredBucket {
                    state,
                    expires_at: now + ttl,
                });
                decision
            }
        };

        trace!(key = %key, allowed = decision.allowed, "Updated in-memory bucket");
        Ok(decision)
    }

    async fn peek(&self, key: &str, update: UpdateFn<'_>) -> Result<Decision> {
        let now = Instant::now();
        let current = self
            .buckets
            .get(key)
            .and_then(|bucket| bucket.live_state(now));
        Ok(update(current).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::advance;
    use crate::ratelimit::rules::RateLimitConfig;

    const TTL: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn test_update_persists_state() {
        let store = MemoryBucketStore::new();
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 0, true);

        let first = store.atomic_update("k", &consume, TTL).await.unwrap();
        let second = store.atomic_update("k", &consume, TTL).await.unwrap();

        assert_eq!(first.remaining_tokens, 9);
        assert_eq!(second.remaining_tokens, 8);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_write() {
        let store = MemoryBucketStore::new();
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 0, true);

        let peeked = store.peek("k", &consume).await.unwrap();
        assert_eq!(peeked.remaining_tokens, 9);
        assert!(store.is_empty());

        store.atomic_update("k", &consume, TTL).await.unwrap();
        store.peek("k", &consume).await.unwrap();
        store.peek("k", &consume).await.unwrap();
        let status = |state| advance(state, &config, 0, false);
        assert_eq!(store.peek("k", &status).await.unwrap().remaining_tokens, 9);
    }

    #[tokio::test]
    async fn test_expired_bucket_reads_as_absent() {
        let store = MemoryBucketStore::new();
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 0, true);

        for _ in 0..5 {
            store
                .atomic_update("k", &consume, Duration::from_millis(20))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let status = |state| advance(state, &config, 0, false);
        assert_eq!(store.peek("k", &status).await.unwrap().remaining_tokens, 10);
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_live_buckets() {
        let store = MemoryBucketStore::new();
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 0, true);

        store.atomic_update("live", &consume, TTL).await.unwrap();
        store
            .atomic_update("stale", &consume, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_linearized() {
        let store = Arc::new(MemoryBucketStore::new());
        let config = Arc::new(RateLimitConfig::new("alice", "/api", "free", 50));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let consume = |state| advance(state, &config, 0, true);
                store.atomic_update("k", &consume, TTL).await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn test_purge_task_reclaims_inactive_keys() {
        let store = Arc::new(MemoryBucketStore::new());
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 0, true);

        for i in 0..500 {
            store
                .atomic_update(&format!("idle-{}", i), &consume, Duration::from_millis(1))
                .await
                .unwrap();
        }
        store.atomic_update("active", &consume, TTL).await.unwrap();
        assert_eq!(store.len(), 501);

        let task = store.spawn_purge_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.len(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_purge_task_stops_with_store() {
        let store = Arc::new(MemoryBucketStore::new());
        let task = store.spawn_purge_task(Duration::from_millis(5));
        drop(store);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("purge task should stop once the store is gone")
            .unwrap();
    }
}
