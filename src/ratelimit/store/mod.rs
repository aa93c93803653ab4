//! Bucket state storage.
//!
//! Stores expose bucket state only through an atomic read-modify-write and a
//! read-only projection, never a raw get/set. A get followed by an
//! uncoordinated put lets concurrent callers read the same state and admit
//! more requests than the bucket holds.

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use super::bucket::{BucketState, Decision};
use crate::error::Result;

pub use self::memory::MemoryBucketStore;
pub use self::redis_store::RedisBucketStore;

/// Computes the next state and the caller's decision from the current state.
///
/// Optimistic stores may call it more than once per update, so it must not
/// have side effects.
pub type UpdateFn<'a> = &'a (dyn Fn(Option<BucketState>) -> (BucketState, Decision) + Send + Sync);

/// Shared storage for bucket state.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Apply `update` to the state at `key` and persist the result.
    ///
    /// Updates to the same key are linearized across every caller of the
    /// store, in this process or another. Each write resets the key's expiry
    /// to `ttl`.
    async fn atomic_update(&self, key: &str, update: UpdateFn<'_>, ttl: Duration) -> Result<Decision>;

    /// Run `update` against the current state without writing anything,
    /// expiry included.
    async fn peek(&self, key: &str, update: UpdateFn<'_>) -> Result<Decision>;
}
