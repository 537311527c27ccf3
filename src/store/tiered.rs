use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{MemoryStore, RecordStore, StoreError};
use crate::models::IdempotencyRecord;

/// Default lifetime of a record copy in the local tier.
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(2);

/// Two-tier store: a short-lived in-process tier (1) in front of a shared
/// store (2), usually Redis.
///
/// Writes go to the shared tier first and are mirrored locally only once
/// they succeed. Local copies live at most `local_ttl`, so a node that read
/// an in-progress record sees the completion from another node shortly
/// after; until then it answers `Retried`, never a stale replay.
#[derive(Clone)]
pub struct TieredStore {
    local: MemoryStore,
    remote: Arc<dyn RecordStore>,
    local_ttl: Duration,
}

impl TieredStore {
    pub fn new(local: MemoryStore, remote: Arc<dyn RecordStore>, local_ttl: Duration) -> Self {
        Self {
            local,
            remote,
            local_ttl,
        }
    }

    pub fn local(&self) -> &MemoryStore {
        &self.local
    }

    fn local_ttl_for(&self, ttl: Duration) -> Duration {
        ttl.min(self.local_ttl)
    }
}

#[async_trait]
impl RecordStore for TieredStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        // tier 1: in-memory
        if let Some(record) = self.local.get(key).await? {
            return Ok(Some(record));
        }

        // tier 2: shared
        let Some(record) = self.remote.get(key).await? else {
            return Ok(None);
        };
        let ttl = self.local_ttl_for(record.remaining_ttl());
        self.local.put(key, &record, ttl).await?;
        Ok(Some(record))
    }

    async fn put(&self, key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<(), StoreError> {
        self.remote.put(key, record, ttl).await?;
        self.local.put(key, record, self.local_ttl_for(ttl)).await
    }

    fn backend(&self) -> &'static str {
        "tiered"
    }
}
