//! Redis-backed bucket store shared by every limiter instance.
//!
//! Each bucket is a hash holding `tokens`, `lastRefillTimeMillis` and a
//! `version` counter. An update reads the hash, runs the update function
//! locally, then commits with a Lua script that only writes if `version` is
//! still the one that was read. A lost race re-reads and retries.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{BucketStore, UpdateFn};
use crate::error::{Result, TollgateError};
use crate::ratelimit::bucket::{BucketState, Decision};

const FIELD_TOKENS: &str = "tokens";
const FIELD_LAST_REFILL: &str = "lastRefillTimeMillis";
const FIELD_VERSION: &str = "version";

/// KEYS[1] bucket key
/// ARGV[1] expected version, ARGV[2] tokens, ARGV[3] last refill millis,
/// ARGV[4] next version, ARGV[5] ttl millis
const COMPARE_AND_SET: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if (current or '0') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'tokens', ARGV[2], 'lastRefillTimeMillis', ARGV[3], 'version', ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
"#;

/// Upper bound for the randomized pause between commit attempts.
const MAX_BACKOFF_MILLIS: u64 = 5;

/// A bucket as read from Redis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Snapshot {
    state: Option<BucketState>,
    version: i64,
}

impl Snapshot {
    /// Build a snapshot from the `HMGET tokens lastRefillTimeMillis version` reply.
    ///
    /// A bucket whose fields are missing or unparseable reads as absent, but
    /// keeps its version so the commit still detects concurrent writers.
    fn from_fields(fields: &[Option<String>]) -> Self {
        let field = |i: usize| fields.get(i).and_then(|v| v.as_deref());

        let version = field(2).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let tokens = field(0).and_then(|v| v.parse::<f64>().ok());
        let last_refill = field(1).and_then(|v| v.parse::<i64>().ok());

        let state = match (tokens, last_refill) {
            (Some(tokens), Some(last_refill)) => Some(BucketState::new(tokens, last_refill)),
            _ => None,
        };

        Self { state, version }
    }
}

/// Versioned bucket records the optimistic update loop runs against.
#[async_trait]
trait VersionedBuckets: Send + Sync {
    /// Read the bucket at `key` along with its version.
    async fn read(&self, key: &str) -> Result<Snapshot>;

    /// Write `state` only if the stored version is still `expected`.
    /// Returns whether the write happened.
    async fn compare_and_set(&self, key: &str, expected: i64, state: BucketState, ttl_millis: u64) -> Result<bool>;
}

/// Redis hashes committed through the compare-and-set script.
#[derive(Clone)]
struct RedisBuckets {
    connection: MultiplexedConnection,
    compare_and_set: Script,
}

#[async_trait]
impl VersionedBuckets for RedisBuckets {
    async fn read(&self, key: &str) -> Result<Snapshot> {
        let mut connection = self.connection.clone();
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(FIELD_TOKENS)
            .arg(FIELD_LAST_REFILL)
            .arg(FIELD_VERSION)
            .query_async(&mut connection)
            .await?;
        Ok(Snapshot::from_fields(&fields))
    }

    async fn compare_and_set(&self, key: &str, expected: i64, state: BucketState, ttl_millis: u64) -> Result<bool> {
        let mut connection = self.connection.clone();
        let committed: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected)
            .arg(state.tokens)
            .arg(state.last_refill_time_millis)
            .arg(expected + 1)
            .arg(ttl_millis)
            .invoke_async(&mut connection)
            .await?;
        Ok(committed == 1)
    }
}

/// Read, compute, commit; on a lost race pause briefly and start over.
///
/// Gives up with `StoreContention` after `max_attempts` lost races.
async fn optimistic_update<B>(
    buckets: &B,
    key: &str,
    update: UpdateFn<'_>,
    ttl: Duration,
    max_attempts: u32,
) -> Result<Decision>
where
    B: VersionedBuckets + ?Sized,
{
    let ttl_millis = (ttl.as_millis() as u64).max(1);

    for attempt in 1..=max_attempts {
        let snapshot = buckets.read(key).await?;
        let (state, decision) = update(snapshot.state);

        if buckets
            .compare_and_set(key, snapshot.version, state, ttl_millis)
            .await?
        {
            trace!(
                key = %key,
                version = snapshot.version + 1,
                attempt = attempt,
                "Committed bucket update"
            );
            return Ok(decision);
        }

        debug!(
            key = %key,
            version = snapshot.version,
            attempt = attempt,
            "Bucket changed underneath update, retrying"
        );

        let pause = rand::thread_rng().gen_range(0..=MAX_BACKOFF_MILLIS);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }

    warn!(key = %key, attempts = max_attempts, "Giving up on contended bucket");
    Err(TollgateError::StoreContention {
        key: key.to_string(),
        attempts: max_attempts,
    })
}

/// Bucket store backed by Redis.
#[derive(Clone)]
pub struct RedisBucketStore {
    buckets: RedisBuckets,
    max_attempts: u32,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl RedisBucketStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, max_attempts: u32) -> Result<Self> {
        info!(url = %url, "Connecting to Redis bucket store");
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::with_connection(connection, max_attempts))
    }

    /// Wrap an existing connection.
    pub fn with_connection(connection: MultiplexedConnection, max_attempts: u32) -> Self {
        Self {
            buckets: RedisBuckets {
                connection,
                compare_and_set: Script::new(COMPARE_AND_SET),
            },
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn atomic_update(&self, key: &str, update: UpdateFn<'_>, ttl: Duration) -> Result<Decision> {
        optimistic_update(&self.buckets, key, update, ttl, self.max_attempts).await
    }

    async fn peek(&self, key: &str, update: UpdateFn<'_>) -> Result<Decision> {
        let snapshot = self.buckets.read(key).await?;
        Ok(update(snapshot.state).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::advance;
    use crate::ratelimit::rules::RateLimitConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fields(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn test_snapshot_of_missing_bucket() {
        let snapshot = Snapshot::from_fields(&fields(&[None, None, None]));
        assert_eq!(snapshot.state, None);
        assert_eq!(snapshot.version, 0);
    }

    #[test]
    fn test_snapshot_of_stored_bucket() {
        let snapshot = Snapshot::from_fields(&fields(&[Some("7.25"), Some("1700000000000"), Some("12")]));
        assert_eq!(snapshot.state, Some(BucketState::new(7.25, 1_700_000_000_000)));
        assert_eq!(snapshot.version, 12);
    }

    #[test]
    fn test_snapshot_of_malformed_bucket_keeps_version() {
        let snapshot = Snapshot::from_fields(&fields(&[Some("lots"), Some("1700000000000"), Some("3")]));
        assert_eq!(snapshot.state, None);
        assert_eq!(snapshot.version, 3);

        let snapshot = Snapshot::from_fields(&fields(&[Some("4.0")]));
        assert_eq!(snapshot.state, None);
        assert_eq!(snapshot.version, 0);
    }

    /// Versioned records in a map. Each of the first `steals` commits loses
    /// to a simulated writer that bumps the stored version.
    #[derive(Default)]
    struct MapBuckets {
        records: Mutex<HashMap<String, (BucketState, i64)>>,
        steals: AtomicU32,
        reads: AtomicU32,
    }

    impl MapBuckets {
        fn stealing(steals: u32) -> Self {
            Self {
                steals: AtomicU32::new(steals),
                ..Self::default()
            }
        }

        fn seed(&self, key: &str, state: BucketState, version: i64) {
            self.records.lock().insert(key.to_string(), (state, version));
        }

        fn version(&self, key: &str) -> Option<i64> {
            self.records.lock().get(key).map(|(_, version)| *version)
        }
    }

    #[async_trait]
    impl VersionedBuckets for MapBuckets {
        async fn read(&self, key: &str) -> Result<Snapshot> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let snapshot = {
                let records = self.records.lock();
                match records.get(key) {
                    Some((state, version)) => Snapshot {
                        state: Some(*state),
                        version: *version,
                    },
                    None => Snapshot {
                        state: None,
                        version: 0,
                    },
                }
            };
            // Let other updates read the same version.
            tokio::task::yield_now().await;
            Ok(snapshot)
        }

        async fn compare_and_set(&self, key: &str, expected: i64, state: BucketState, _ttl_millis: u64) -> Result<bool> {
            let mut records = self.records.lock();
            let current = records.get(key).map(|(_, version)| *version).unwrap_or(0);

            let stolen = self
                .steals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stolen {
                if let Some(record) = records.get_mut(key) {
                    record.1 += 1;
                }
                return Ok(false);
            }

            if current != expected {
                return Ok(false);
            }
            records.insert(key.to_string(), (state, expected + 1));
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_lost_race_is_retried() {
        let buckets = MapBuckets::stealing(2);
        buckets.seed("k", BucketState::new(10.0, 1_000), 5);
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 1_000, true);

        let decision = optimistic_update(&buckets, "k", &consume, Duration::from_secs(120), 16)
            .await
            .unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining_tokens, 9);
        assert_eq!(buckets.reads.load(Ordering::SeqCst), 3);
        assert_eq!(buckets.version("k"), Some(8));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_report_contention() {
        let buckets = MapBuckets::stealing(u32::MAX);
        let config = RateLimitConfig::new("alice", "/api", "free", 10);
        let consume = |state| advance(state, &config, 1_000, true);

        let err = optimistic_update(&buckets, "k", &consume, Duration::from_secs(120), 4)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TollgateError::StoreContention { ref key, attempts: 4 } if key == "k"
        ));
        assert_eq!(buckets.reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_optimistic_updates_admit_capacity() {
        let buckets = Arc::new(MapBuckets::default());
        let config = Arc::new(RateLimitConfig::new("alice", "/burst", "free", 20));

        let mut handles = Vec::new();
        for _ in 0..60 {
            let buckets = buckets.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let consume = |state| advance(state, &config, 1_000, true);
                optimistic_update(buckets.as_ref(), "k", &consume, Duration::from_secs(120), 10_000)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
        assert_eq!(buckets.version("k"), Some(60));
    }

    fn test_redis_url() -> String {
        std::env::var("TOLLGATE_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn clear(store: &RedisBucketStore, key: &str) {
        let mut connection = store.buckets.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_update_and_peek() {
        let store = RedisBucketStore::connect(&test_redis_url(), 16).await.unwrap();
        let key = format!("rate_limit:test-{}:/peek", uuid::Uuid::new_v4());
        let config = RateLimitConfig::new("alice", "/peek", "free", 10);
        let consume = |state| advance(state, &config, 1_000, true);
        let status = |state| advance(state, &config, 1_000, false);

        assert_eq!(store.peek(&key, &status).await.unwrap().remaining_tokens, 10);
        let decision = store
            .atomic_update(&key, &consume, Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(decision.remaining_tokens, 9);
        assert_eq!(store.peek(&key, &status).await.unwrap().remaining_tokens, 9);
        assert_eq!(store.peek(&key, &status).await.unwrap().remaining_tokens, 9);

        let mut connection = store.buckets.connection.clone();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(&key)
            .query_async(&mut connection)
            .await
            .unwrap();
        assert!(ttl > 0 && ttl <= 120_000);

        clear(&store, &key).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_concurrent_updates_admit_capacity() {
        let store = Arc::new(RedisBucketStore::connect(&test_redis_url(), 1_000).await.unwrap());
        let key = format!("rate_limit:test-{}:/burst", uuid::Uuid::new_v4());
        let config = Arc::new(RateLimitConfig::new("alice", "/burst", "free", 20));

        let mut handles = Vec::new();
        for _ in 0..60 {
            let store = store.clone();
            let config = config.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let consume = |state| advance(state, &config, 1_000, true);
                store
                    .atomic_update(&key, &consume, Duration::from_secs(120))
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);

        clear(&store, &key).await;
    }
}
