//! Background job: drop expired idempotency records from the in-process store.
//!
//! Reads already ignore expired entries; this only bounds memory held by
//! keys that are never seen again.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::store::MemoryStore;

/// Spawn the sweep task. Call this once at startup.
pub fn spawn(store: MemoryStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep(&store);
        }
    })
}

fn sweep(store: &MemoryStore) -> usize {
    let evicted = store.evict_expired();
    if evicted > 0 {
        tracing::info!(evicted, remaining = store.len(), "swept expired idempotency records");
    }
    evicted
}
