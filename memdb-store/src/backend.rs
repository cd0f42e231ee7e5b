//! Store adapter capability set.
//!
//! The engine talks to its durable store through [`StoreBackend`]. The
//! production implementation is [`crate::PgStore`]; tests use
//! [`crate::MemoryStore`]. Implementations must be safe to share across
//! tasks and must never require the caller to hold any engine lock.

use async_trait::async_trait;
use memdb_core::{Document, StoreError, StoreResult};

/// Per-item acknowledgement report for a batch upsert.
///
/// Whole-batch atomicity is not part of the contract: a batch may land
/// partially, and the flush engine keeps unacknowledged items dirty for
/// the next tick. Implementations that cannot distinguish per-item
/// outcomes report wholesale failure by returning `Err` from
/// [`StoreBackend::upsert_batch`] instead.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Keys the store acknowledged, in no particular order.
    pub acknowledged: Vec<String>,
    /// Keys that failed, each with the error the store reported.
    pub failed: Vec<(String, StoreError)>,
}

impl BatchOutcome {
    /// Report with every item acknowledged.
    pub fn all_acknowledged(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            acknowledged: keys.into_iter().collect(),
            failed: Vec::new(),
        }
    }

    /// Number of acknowledged items.
    pub fn acknowledged_count(&self) -> usize {
        self.acknowledged.len()
    }

    /// Whether any item failed.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Capability set over a durable key/document store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Idempotently create the backing table for `table`.
    ///
    /// The schema hint is advisory; the physical layout is always
    /// `(key, data, created_at, updated_at)` with a JSON-path index on
    /// `data`. Never drops existing data.
    async fn ensure_table(&self, table: &str, schema_hint: &Document) -> StoreResult<()>;

    /// Fetch a single document by key. `Ok(None)` if absent.
    async fn fetch(&self, table: &str, key: &str) -> StoreResult<Option<Document>>;

    /// Insert-or-update each `(key, document)` pair by primary key.
    ///
    /// Atomic per item, not per batch. Returns the per-item outcome;
    /// `Err` means the whole call failed and nothing is known to have
    /// landed.
    async fn upsert_batch(
        &self,
        table: &str,
        items: &[(String, Document)],
    ) -> StoreResult<BatchOutcome>;

    /// Pass an opaque predicate through to the store.
    ///
    /// Each returned document carries its row key injected under
    /// [`memdb_core::KEY_FIELD`]. An empty predicate matches all rows.
    async fn query(&self, table: &str, predicate: &str, limit: usize)
        -> StoreResult<Vec<Document>>;

    /// Release any pooled resources. Default is a no-op.
    async fn close(&self) {}
}

#[async_trait]
impl<S: StoreBackend + ?Sized> StoreBackend for std::sync::Arc<S> {
    async fn ensure_table(&self, table: &str, schema_hint: &Document) -> StoreResult<()> {
        (**self).ensure_table(table, schema_hint).await
    }

    async fn fetch(&self, table: &str, key: &str) -> StoreResult<Option<Document>> {
        (**self).fetch(table, key).await
    }

    async fn upsert_batch(
        &self,
        table: &str,
        items: &[(String, Document)],
    ) -> StoreResult<BatchOutcome> {
        (**self).upsert_batch(table, items).await
    }

    async fn query(
        &self,
        table: &str,
        predicate: &str,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        (**self).query(table, predicate, limit).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_outcome_accounting() {
        let outcome = BatchOutcome::all_acknowledged(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(outcome.acknowledged_count(), 2);
        assert!(!outcome.has_failures());

        let outcome = BatchOutcome {
            acknowledged: vec!["a".to_string()],
            failed: vec![(
                "b".to_string(),
                StoreError::Unavailable {
                    reason: "connection reset".to_string(),
                },
            )],
        };
        assert_eq!(outcome.acknowledged_count(), 1);
        assert!(outcome.has_failures());
    }
}
