//! Backing store
//!
//! The engine only needs a handful of list and sorted-set commands. They are
//! collected in [`JobStore`] so the pipeline can run against Redis in
//! production and against [`MemoryStore`] in tests.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// List and sorted-set commands used by the engine.
///
/// Method names follow the Redis command each one maps to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Push `value` onto the head of the list at `key`
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically move the tail of `source` onto the head of `destination`,
    /// waiting up to `timeout` for `source` to become non-empty.
    ///
    /// `Ok(None)` means the wait timed out, which is not an error.
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Whole list, head first
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Remove one occurrence of `value`, searching from the tail.
    /// Returns the number of removed elements.
    async fn lrem_last(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Add or re-score `member`
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;

    /// Lowest scored member with `score <= max_score`
    async fn zfirst_due(&self, key: &str, max_score: f64) -> Result<Option<String>, StoreError>;

    /// Remove `member`; `false` when it was already gone
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// Members by rank, lowest score first, `stop` inclusive
    async fn zrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// A handle whose blocking calls cannot stall other users of this store.
    ///
    /// Each fetcher asks for one before it starts polling.
    async fn dedicated(&self) -> Result<Arc<dyn JobStore>, StoreError>;
}
