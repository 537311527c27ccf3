//! Record stores: the key-value boundary under the idempotency cache.
//!
//! Stores offer plain get/put-with-TTL. They are not expected to provide
//! compare-and-swap; per-key atomicity comes from the
//! [`KeyLockTable`](crate::lock::KeyLockTable) above them.

pub mod memory;
pub mod redis;
pub mod tiered;

use std::time::Duration;

use async_trait::async_trait;

use crate::models::IdempotencyRecord;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::tiered::TieredStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a live record. Expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Store `record` under `key`, replacing any previous value, expiring after `ttl`.
    async fn put(&self, key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Backend label for logs and metrics.
    fn backend(&self) -> &'static str;
}
