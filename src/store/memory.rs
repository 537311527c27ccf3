use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{RecordStore, StoreError};
use crate::models::IdempotencyRecord;

/// Default capacity of the in-process store.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

#[derive(Clone)]
struct Entry {
    record: IdempotencyRecord,
    expires_at: Instant,
}

/// Single-node store: a `DashMap` whose entries carry an expiry instant.
///
/// Expired entries are dropped lazily on read and in bulk by
/// [`evict_expired`](Self::evict_expired). When the map is full, inserting a
/// new key first evicts expired entries and then the entry closest to expiry.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    max_entries: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove `key` only if the entry is still the one that had expired at
    /// `now`; a put may have replaced it since it was read.
    fn remove_expired(&self, key: &str, now: Instant) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now)
            .is_some()
    }

    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let evicted = self.evict_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "memory store: evicted expired records");
        }
        while self.entries.len() >= self.max_entries {
            let soonest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.expires_at)
                .map(|entry| entry.key().clone());
            match soonest {
                Some(key) => {
                    self.entries.remove(&key);
                    tracing::warn!("memory store: at capacity, evicted live record closest to expiry");
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if now < entry.expires_at {
                return Ok(Some(entry.record.clone()));
            }
        }
        self.remove_expired(key, now);
        Ok(None)
    }

    async fn put(&self, key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<(), StoreError> {
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                record: record.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
