use std::sync::Arc;
use std::time::Duration;

use crate::models::IdempotencyRecord;
use crate::sanitize::sanitize_key;
use crate::store::{RecordStore, StoreError};

/// Default record lifetime: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default namespace for idempotency records in a shared store.
pub const DEFAULT_KEY_PREFIX: &str = "idem:";

/// Idempotency records on top of a pluggable [`RecordStore`].
///
/// Adds key namespacing and creation-relative TTLs. Callers must hold the
/// key's [`LockHandle`](crate::lock::LockHandle) around
/// [`get_or_create`](Self::get_or_create) and [`set`](Self::set); the cache
/// itself does no locking.
#[derive(Clone)]
pub struct IdempotencyCache {
    store: Arc<dyn RecordStore>,
    prefix: String,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn RecordStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.store.get(&self.store_key(key)).await
    }

    /// Return the live record for `key`, or store and return a fresh one
    /// (empty fingerprint) expiring after `ttl`, or the default TTL.
    pub async fn get_or_create(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<IdempotencyRecord, StoreError> {
        let store_key = self.store_key(key);
        if let Some(record) = self.store.get(&store_key).await? {
            return Ok(record);
        }

        let ttl = ttl.unwrap_or(self.ttl);
        let record = IdempotencyRecord::new(ttl);
        self.store.put(&store_key, &record, ttl).await?;
        tracing::debug!(
            key = %sanitize_key(key),
            backend = self.store.backend(),
            ttl_secs = ttl.as_secs(),
            "idempotency record created"
        );
        Ok(record)
    }

    /// Persist `record`, keeping the expiry it was created with.
    pub async fn set(&self, key: &str, record: &IdempotencyRecord) -> Result<(), StoreError> {
        self.store
            .put(&self.store_key(key), record, record.remaining_ttl())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache_with(store: MemoryStore) -> IdempotencyCache {
        IdempotencyCache::new(Arc::new(store), DEFAULT_KEY_PREFIX, DEFAULT_TTL)
    }

    #[tokio::test]
    async fn test_get_or_create_creates_fresh_record() {
        let store = MemoryStore::default();
        let cache = cache_with(store.clone());

        let record = cache.get_or_create("k1", None).await.unwrap();
        assert!(record.is_fresh());
        assert!(store.get("idem:k1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing() {
        let cache = cache_with(MemoryStore::default());

        let mut record = cache.get_or_create("k1", None).await.unwrap();
        record.fingerprint = "fp".into();
        cache.set("k1", &record).await.unwrap();

        let again = cache.get_or_create("k1", None).await.unwrap();
        assert_eq!(again.fingerprint, "fp");
        assert_eq!(again.created_at, record.created_at);
    }

    #[tokio::test]
    async fn test_ttl_override_applies_to_new_record() {
        let cache = cache_with(MemoryStore::default());
        let record = cache
            .get_or_create("k1", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!((record.expires_at - record.created_at).num_seconds(), 30);
    }

    #[tokio::test]
    async fn test_prefix_isolates_namespaces() {
        let store = MemoryStore::default();
        let a = IdempotencyCache::new(Arc::new(store.clone()), "a:", DEFAULT_TTL);
        let b = IdempotencyCache::new(Arc::new(store), "b:", DEFAULT_TTL);

        let mut record = a.get_or_create("k", None).await.unwrap();
        record.fingerprint = "fp".into();
        a.set("k", &record).await.unwrap();

        assert!(b.get("k").await.unwrap().is_none());
    }
}
