//! In-memory store fake for engine tests.
//!
//! Implements the full [`StoreBackend`] capability set over plain maps,
//! with call counters and failure injection so engine tests can observe
//! exactly how the cache drives its store: how many fetches a concurrent
//! miss issues, how many upserts a coalesced flush performs, and how the
//! flush engine behaves under wholesale and per-item failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use memdb_core::{Document, StoreError, StoreResult, KEY_FIELD};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::backend::{BatchOutcome, StoreBackend};

#[derive(Default)]
struct MemoryState {
    /// table -> key -> document
    tables: HashMap<String, HashMap<String, Document>>,
    /// Keys whose upserts fail with a per-item error.
    poisoned: HashSet<(String, String)>,
    /// Number of upcoming `upsert_batch` calls that fail wholesale.
    fail_next_upserts: u32,
    /// Predicates seen by `query`, for pass-through assertions.
    seen_predicates: Vec<String>,
}

/// In-memory [`StoreBackend`] with observability hooks.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fetch_calls: AtomicU64,
    upsert_batches: AtomicU64,
    upserted_items: AtomicU64,
    /// Artificial latency applied to `fetch`, to widen race windows.
    fetch_delay: Mutex<Option<Duration>>,
    /// Artificial latency applied to `upsert_batch`, to let writes land
    /// while a flush is in flight.
    upsert_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `fetch` calls issued so far.
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    /// Number of `upsert_batch` calls issued so far.
    pub fn upsert_batches(&self) -> u64 {
        self.upsert_batches.load(Ordering::Relaxed)
    }

    /// Number of individual items acknowledged across all batches.
    pub fn upserted_items(&self) -> u64 {
        self.upserted_items.load(Ordering::Relaxed)
    }

    /// Make the next `n` `upsert_batch` calls fail wholesale.
    pub fn fail_next_upserts(&self, n: u32) {
        self.state.lock().fail_next_upserts = n;
    }

    /// Make upserts of one key fail while the rest of its batch lands.
    pub fn poison_key(&self, table: &str, key: &str) {
        self.state
            .lock()
            .poisoned
            .insert((table.to_string(), key.to_string()));
    }

    /// Clear a previously poisoned key.
    pub fn heal_key(&self, table: &str, key: &str) {
        self.state
            .lock()
            .poisoned
            .remove(&(table.to_string(), key.to_string()));
    }

    /// Delay every `fetch` by `delay`, to let concurrent misses pile up.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    /// Delay every `upsert_batch` by `delay`.
    pub fn set_upsert_delay(&self, delay: Duration) {
        *self.upsert_delay.lock() = Some(delay);
    }

    /// Read a document directly, bypassing the adapter interface.
    pub fn raw_get(&self, table: &str, key: &str) -> Option<Document> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    /// Write a document directly, bypassing the adapter interface.
    pub fn raw_put(&self, table: &str, key: &str, doc: Document) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), doc);
    }

    /// Number of rows persisted for `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    /// Predicates passed through to `query`, in call order.
    pub fn seen_predicates(&self) -> Vec<String> {
        self.state.lock().seen_predicates.clone()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn ensure_table(&self, table: &str, _schema_hint: &Document) -> StoreResult<()> {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn fetch(&self, table: &str, key: &str) -> StoreResult<Option<Document>> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn upsert_batch(
        &self,
        table: &str,
        items: &[(String, Document)],
    ) -> StoreResult<BatchOutcome> {
        self.upsert_batches.fetch_add(1, Ordering::Relaxed);
        let delay = *self.upsert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_next_upserts > 0 {
            state.fail_next_upserts -= 1;
            return Err(StoreError::Unavailable {
                reason: "injected wholesale failure".to_string(),
            });
        }

        let mut outcome = BatchOutcome::default();
        for (key, doc) in items {
            if state.poisoned.contains(&(table.to_string(), key.clone())) {
                outcome.failed.push((
                    key.clone(),
                    StoreError::Unavailable {
                        reason: "injected item failure".to_string(),
                    },
                ));
                continue;
            }
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(key.clone(), doc.clone());
            outcome.acknowledged.push(key.clone());
        }
        self.upserted_items
            .fetch_add(outcome.acknowledged.len() as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    async fn query(
        &self,
        table: &str,
        predicate: &str,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let mut state = self.state.lock();
        state.seen_predicates.push(predicate.to_string());

        // Predicates are opaque SQL and not interpreted here; the fake
        // returns every row, limit-capped, which is all the engine
        // properties need.
        let mut docs: Vec<(String, Document)> = state
            .tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs.truncate(limit);

        Ok(docs
            .into_iter()
            .map(|(key, mut doc)| {
                if let Some(map) = doc.as_object_mut() {
                    map.insert(KEY_FIELD.to_string(), JsonValue::String(key));
                }
                doc
            })
            .collect())
    }
}
