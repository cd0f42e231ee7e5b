//! Eviction pipeline: drop clean entries that have sat idle.
//!
//! Entirely in-memory; one pass holds the engine mutex for the duration
//! of the sweep. Dirty entries are never removed, whatever their age —
//! a record may only leave memory once the store has acknowledged it.

use std::sync::atomic::Ordering;

use memdb_store::StoreBackend;

use crate::engine::EngineInner;

/// Run one eviction pass. Returns the number of entries removed.
pub(crate) fn evict_pass<S: StoreBackend>(inner: &EngineInner<S>) -> usize {
    let idle_for = inner.config.evict_interval;
    let evicted = inner.state.lock().index.evict_idle(idle_for);

    if evicted > 0 {
        inner
            .metrics
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        tracing::info!(evicted, "evicted idle records");
    } else {
        tracing::trace!("eviction pass found nothing idle");
    }
    evicted
}
