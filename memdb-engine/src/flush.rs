//! Flush pipeline: drain dirty entries to the store in batches.
//!
//! A pass follows the snapshot-under-lock / I/O-without-lock /
//! reconcile-under-lock discipline. The engine mutex is taken twice per
//! table at most (snapshot, reconcile) and never spans a store call.
//! Entries whose version advanced between snapshot and acknowledgement
//! stay dirty; the mutation after the snapshot has not been persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;

use memdb_core::{Document, StoreError};
use memdb_store::StoreBackend;
use serde_json::json;

use crate::engine::EngineInner;
use crate::index::DirtyRecord;

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Entries cleanly persisted this pass: acknowledged by the store
    /// with no write racing the flush.
    pub persisted: usize,
    /// Entries that remain dirty for the next tick, whether the store
    /// rejected them or a write landed while the batch was in flight.
    pub failed: usize,
    /// Table batches attempted (including ones that failed wholesale).
    pub batches: usize,
    /// Batches where not a single item was acknowledged.
    pub wholesale_failures: usize,
    /// Tables skipped because of an unresolved schema error.
    pub skipped_tables: Vec<String>,
}

impl FlushReport {
    /// Whether every attempted batch failed wholesale.
    pub fn all_failed(&self) -> bool {
        self.batches > 0 && self.wholesale_failures == self.batches
    }
}

/// Run one flush pass over `scope` (one table, or all).
pub(crate) async fn flush_pass<S: StoreBackend>(
    inner: &EngineInner<S>,
    scope: Option<&str>,
) -> FlushReport {
    let mut report = FlushReport::default();

    // Snapshot under the mutex. Quarantined tables are dropped from the
    // candidate set; tables never bootstrapped get their schema hint
    // captured so DDL can run before the first batch.
    let (groups, bootstraps) = {
        let state = inner.state.lock();
        let snapshot = state.index.snapshot_dirty(scope);
        if snapshot.is_empty() {
            return report;
        }

        let mut groups: BTreeMap<String, Vec<DirtyRecord>> = BTreeMap::new();
        for record in snapshot {
            groups.entry(record.table.clone()).or_default().push(record);
        }
        groups.retain(|table, _| {
            let quarantined = state.quarantined.contains_key(table);
            if quarantined {
                tracing::debug!(table = %table, "skipping quarantined table");
                report.skipped_tables.push(table.clone());
            }
            !quarantined
        });

        let bootstraps: HashMap<String, Document> = groups
            .keys()
            .filter(|table| !state.bootstrapped.contains(*table))
            .map(|table| {
                let hint = state.tables.get(table).cloned().unwrap_or_else(|| json!({}));
                (table.clone(), hint)
            })
            .collect();

        (groups, bootstraps)
    };

    for (table, records) in groups {
        report.batches += 1;

        if let Some(hint) = bootstraps.get(&table) {
            match inner.store.ensure_table(&table, hint).await {
                Ok(()) => {
                    inner.state.lock().bootstrapped.insert(table.clone());
                }
                Err(StoreError::Schema { reason, .. }) => {
                    inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        table = %table,
                        reason = %reason,
                        "schema error; table quarantined until recreated"
                    );
                    inner.state.lock().quarantined.insert(table.clone(), reason);
                    report.skipped_tables.push(table.clone());
                    report.failed += records.len();
                    report.wholesale_failures += 1;
                    continue;
                }
                Err(e) => {
                    inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        table = %table,
                        error = %e,
                        "table bootstrap failed; will retry next tick"
                    );
                    report.failed += records.len();
                    report.wholesale_failures += 1;
                    continue;
                }
            }
        }

        let versions: HashMap<&str, u64> = records
            .iter()
            .map(|r| (r.key.as_str(), r.version))
            .collect();
        let items: Vec<(String, Document)> = records
            .iter()
            .map(|r| (r.key.clone(), r.document.clone()))
            .collect();

        match inner.store.upsert_batch(&table, &items).await {
            Err(e) => {
                inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                let mut state = inner.state.lock();
                *state.flush_failures.entry(table.clone()).or_default() += items.len() as u64;
                drop(state);
                report.failed += items.len();
                report.wholesale_failures += 1;
                tracing::warn!(
                    table = %table,
                    records = items.len(),
                    error = %e,
                    "flush batch failed; entries stay dirty"
                );
            }
            Ok(outcome) => {
                let acked = outcome.acknowledged.len();
                let mut cleared = 0usize;
                {
                    let mut state = inner.state.lock();
                    for key in &outcome.acknowledged {
                        let Some(&version) = versions.get(key.as_str()) else {
                            tracing::error!(
                                table = %table,
                                key = %key,
                                "store acknowledged a key missing from the flush snapshot; aborting pass"
                            );
                            return report;
                        };
                        if state.index.clear_dirty_if_unchanged(&table, key, version) {
                            cleared += 1;
                        }
                    }
                    if !outcome.failed.is_empty() {
                        *state.flush_failures.entry(table.clone()).or_default() +=
                            outcome.failed.len() as u64;
                    }
                }

                // Only entries whose version survived the round trip are
                // cleanly persisted; an acknowledged entry that was
                // re-dirtied mid-flight stays dirty and counts as such.
                let redirtied = acked - cleared;
                inner.metrics.flushes.fetch_add(cleared as u64, Ordering::Relaxed);
                inner
                    .metrics
                    .store_errors
                    .fetch_add(outcome.failed.len() as u64, Ordering::Relaxed);
                report.persisted += cleared;
                report.failed += outcome.failed.len() + redirtied;

                if !outcome.failed.is_empty() {
                    tracing::warn!(
                        table = %table,
                        persisted = cleared,
                        failed = outcome.failed.len(),
                        "flush batch partially failed; failed entries stay dirty"
                    );
                } else if cleared > 0 {
                    tracing::info!(table = %table, records = cleared, "flushed records");
                }
                if redirtied > 0 {
                    tracing::debug!(
                        table = %table,
                        acked,
                        cleared,
                        "entries re-dirtied during flush stay dirty"
                    );
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineInner;
    use memdb_core::MemDbConfig;
    use memdb_store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn test_inner() -> EngineInner<MemoryStore> {
        EngineInner::new(
            MemDbConfig::development("postgres://test"),
            MemoryStore::new(),
        )
    }

    #[tokio::test]
    async fn test_empty_pass_is_a_noop() {
        let inner = test_inner();
        let report = flush_pass(&inner, None).await;
        assert_eq!(report.persisted, 0);
        assert_eq!(report.batches, 0);
        assert_eq!(inner.store.upsert_batches(), 0);
    }

    #[tokio::test]
    async fn test_pass_persists_and_cleans() {
        let inner = test_inner();
        {
            let mut state = inner.state.lock();
            state.tables.insert("users".to_string(), json!({}));
            state.index.put("users", "a", json!({"n": "A"}), true);
            state.index.put("users", "b", json!({"n": "B"}), true);
        }

        let report = flush_pass(&inner, None).await;

        assert_eq!(report.persisted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(inner.store.raw_get("users", "a"), Some(json!({"n": "A"})));
        let state = inner.state.lock();
        assert_eq!(state.index.dirty_len(), 0);
        assert!(state.bootstrapped.contains("users"));
    }

    #[tokio::test]
    async fn test_scoped_pass_leaves_other_tables_dirty() {
        let inner = test_inner();
        {
            let mut state = inner.state.lock();
            state.tables.insert("users".to_string(), json!({}));
            state.tables.insert("posts".to_string(), json!({}));
            state.index.put("users", "a", json!({"n": 1}), true);
            state.index.put("posts", "p", json!({"t": 1}), true);
        }

        let report = flush_pass(&inner, Some("users")).await;

        assert_eq!(report.persisted, 1);
        assert_eq!(inner.store.row_count("users"), 1);
        assert_eq!(inner.store.row_count("posts"), 0);
        assert_eq!(inner.state.lock().index.dirty_len(), 1);
    }

    #[tokio::test]
    async fn test_wholesale_failure_keeps_entries_dirty_and_retries() {
        let inner = test_inner();
        {
            let mut state = inner.state.lock();
            state.tables.insert("users".to_string(), json!({}));
            state.bootstrapped.insert("users".to_string());
            state.index.put("users", "a", json!({"n": 1}), true);
        }
        inner.store.fail_next_upserts(1);

        let report = flush_pass(&inner, None).await;
        assert!(report.all_failed());
        assert_eq!(inner.state.lock().index.dirty_len(), 1);

        // Next pass succeeds with no operator intervention.
        let report = flush_pass(&inner, None).await;
        assert_eq!(report.persisted, 1);
        assert_eq!(inner.state.lock().index.dirty_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_and_retries_failed_items_only() {
        let inner = test_inner();
        {
            let mut state = inner.state.lock();
            state.tables.insert("users".to_string(), json!({}));
            state.bootstrapped.insert("users".to_string());
            state.index.put("users", "good", json!({"n": 1}), true);
            state.index.put("users", "bad", json!({"n": 2}), true);
        }
        inner.store.poison_key("users", "bad");

        let report = flush_pass(&inner, None).await;
        assert_eq!(report.persisted, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.all_failed());
        {
            let state = inner.state.lock();
            assert_eq!(state.index.is_dirty("users", "good"), Some(false));
            assert_eq!(state.index.is_dirty("users", "bad"), Some(true));
            assert_eq!(state.flush_failures.get("users"), Some(&1));
        }

        inner.store.heal_key("users", "bad");
        let report = flush_pass(&inner, None).await;
        assert_eq!(report.persisted, 1);
        assert_eq!(inner.state.lock().index.dirty_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_during_flush_stays_dirty_and_is_not_counted() {
        let inner = test_inner();
        {
            let mut state = inner.state.lock();
            state.tables.insert("users".to_string(), json!({}));
            state.bootstrapped.insert("users".to_string());
            state.index.put("users", "a", json!({"n": "old"}), true);
        }

        // Hold the batch in the store long enough for a write to land
        // between the snapshot and the reconcile step.
        inner.store.set_upsert_delay(Duration::from_millis(50));
        let (report, _) = tokio::join!(flush_pass(&inner, None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner
                .state
                .lock()
                .index
                .put("users", "a", json!({"n": "new"}), true);
        });

        // The store acknowledged the snapshot image, but the entry was
        // re-dirtied mid-flight: nothing was cleanly persisted.
        assert_eq!(report.persisted, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(inner.metrics.flushes.load(Ordering::Relaxed), 0);
        assert_eq!(inner.state.lock().index.is_dirty("users", "a"), Some(true));
        assert_eq!(inner.store.raw_get("users", "a"), Some(json!({"n": "old"})));

        // The next pass persists the racing write and counts it.
        let report = flush_pass(&inner, None).await;
        assert_eq!(report.persisted, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(inner.metrics.flushes.load(Ordering::Relaxed), 1);
        assert_eq!(inner.state.lock().index.dirty_len(), 0);
        assert_eq!(inner.store.raw_get("users", "a"), Some(json!({"n": "new"})));
    }
}
