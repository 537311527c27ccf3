//! Per-key mutual exclusion over an open-ended key space.
//!
//! Each active key owns one async mutex plus a count of callers that hold
//! or wait on it. The count is adjusted under the map's shard lock, and the
//! slot is removed only when it drops to zero, so the table holds nothing
//! for idle keys and a waiter is never handed a mutex that was torn down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<Mutex<()>>,
    holders: usize,
}

type Slots = Arc<DashMap<String, Slot>>;

#[derive(Debug, thiserror::Error)]
#[error("timed out after {0:?} waiting for idempotency key lock")]
pub struct LockTimeout(pub Duration);

/// Explicitly constructed lock table; share it by cloning.
#[derive(Clone, Default)]
pub struct KeyLockTable {
    slots: Slots,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other caller holds `key`, then hold it until the
    /// returned handle is dropped. Dropping this future while it waits gives
    /// the reference back exactly like a release.
    pub async fn acquire(&self, key: &str) -> LockHandle {
        let ticket = self.register(key);
        let guard = ticket.mutex.clone().lock_owned().await;
        LockHandle {
            _guard: guard,
            ticket,
        }
    }

    /// [`acquire`](Self::acquire) bounded by `timeout`.
    pub async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<LockHandle, LockTimeout> {
        tokio::time::timeout(timeout, self.acquire(key))
            .await
            .map_err(|_| LockTimeout(timeout))
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots.len()
    }

    /// Callers holding or waiting on `key`.
    pub fn holders(&self, key: &str) -> usize {
        self.slots.get(key).map(|slot| slot.holders).unwrap_or(0)
    }

    fn register(&self, key: &str) -> Ticket {
        let mutex = {
            let mut slot = self.slots.entry(key.to_owned()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            slot.mutex.clone()
        };
        Ticket {
            slots: self.slots.clone(),
            key: key.to_owned(),
            mutex,
        }
    }
}

/// One counted reference to a slot; dropping it gives the reference back.
struct Ticket {
    slots: Slots,
    key: String,
    mutex: Arc<Mutex<()>>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.slots.entry(std::mem::take(&mut self.key)) {
            let remaining = slot.get().holders.saturating_sub(1);
            if remaining == 0 {
                slot.remove();
            } else {
                slot.get_mut().holders = remaining;
            }
        }
    }
}

/// Exclusive hold on one key.
///
/// Fields drop in declaration order: the mutex is unlocked before the
/// reference is returned, so the slot can never vanish under a live guard.
pub struct LockHandle {
    _guard: OwnedMutexGuard<()>,
    ticket: Ticket,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.ticket.key
    }

    pub fn release(self) {}
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle").field("key", &self.ticket.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_table_is_empty_after_release() {
        let table = KeyLockTable::new();
        let handle = table.acquire("k1").await;
        assert_eq!(handle.key(), "k1");
        assert_eq!(table.holders("k1"), 1);
        handle.release();
        assert_eq!(table.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let table = KeyLockTable::new();
        let _a = table.acquire("a").await;
        let b = table.acquire_timeout("b", Duration::from_millis(100)).await;
        assert!(b.is_ok());
        assert_eq!(table.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_timeout_returns_reference() {
        let table = KeyLockTable::new();
        let held = table.acquire("k").await;

        let err = table.acquire_timeout("k", Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.0, Duration::from_millis(20));
        assert_eq!(table.holders("k"), 1);

        drop(held);
        assert_eq!(table.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_aborted_waiter_returns_reference() {
        let table = KeyLockTable::new();
        let held = table.acquire("k").await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let _h = table.acquire("k").await;
            })
        };
        while table.holders("k") < 2 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(table.holders("k"), 1);
        drop(held);
        assert_eq!(table.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let table = KeyLockTable::new();
        let held = table.acquire("k").await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("k").await.key().to_string() })
        };
        while table.holders("k") < 2 {
            tokio::task::yield_now().await;
        }
        drop(held);

        assert_eq!(waiter.await.unwrap(), "k");
        assert_eq!(table.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_exclusive_under_contention() {
        let table = KeyLockTable::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let table = table.clone();
                let inside = inside.clone();
                let entered = entered.clone();
                tokio::spawn(async move {
                    let _h = table.acquire("shared").await;
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders at once");
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 64);
        assert_eq!(table.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_keys_no_deadlock_no_leak() {
        let table = KeyLockTable::new();
        let tasks: Vec<_> = (0..400)
            .map(|i| {
                let table = table.clone();
                tokio::spawn(async move {
                    let key = format!("key-{}", i % 13);
                    let h = table
                        .acquire_timeout(&key, Duration::from_secs(5))
                        .await
                        .expect("lock wait should not time out");
                    tokio::task::yield_now().await;
                    h.release();
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(table.active_keys(), 0);
    }
}
