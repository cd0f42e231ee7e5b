//! Engine facade: lifecycle, public operations, and the single-flight
//! read-through path.
//!
//! One `parking_lot` mutex guards all shared engine state (record
//! index, in-flight load registry, table registry). It is never held
//! across a store call or any await point; the write path touches only
//! memory, so `insert` completes in bounded local time whatever the
//! store is doing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use memdb_core::{
    validate_address, validate_document, Document, MemDbConfig, MemDbError, MemDbResult,
    StoreError,
};
use memdb_store::{PgStore, StoreBackend};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use crate::flush::{flush_pass, FlushReport};
use crate::evict::evict_pass;
use crate::index::RecordIndex;
use crate::stats::{EngineMetrics, StatsSnapshot};
use crate::tasks::{spawn_background_tasks, BackgroundTasks};

// ============================================================================
// SHARED ENGINE STATE
// ============================================================================

/// Result of a cache-miss load, broadcast to single-flight waiters.
pub(crate) type LoadOutcome = Result<Option<Document>, StoreError>;

/// Everything guarded by the engine mutex.
#[derive(Default)]
pub(crate) struct EngineState {
    pub index: RecordIndex,
    /// Cache-miss loads currently talking to the store. Waiters clone
    /// the receiver and await the winner's broadcast off-lock.
    pub in_flight: HashMap<(String, String), watch::Receiver<Option<LoadOutcome>>>,
    /// Registered tables with their advisory schema hints.
    pub tables: HashMap<String, Document>,
    /// Tables whose backing DDL has been run this process.
    pub bootstrapped: HashSet<String>,
    /// Tables skipped by flush until recreated, with the schema error
    /// that put them there.
    pub quarantined: HashMap<String, String>,
    /// Per-table count of flush items the store did not acknowledge.
    pub flush_failures: HashMap<String, u64>,
}

/// State shared between the facade and the background workers.
pub(crate) struct EngineInner<S> {
    pub config: MemDbConfig,
    pub store: S,
    pub state: Mutex<EngineState>,
    pub metrics: EngineMetrics,
    pub stopped: AtomicBool,
    pub started_at: DateTime<Utc>,
}

impl<S> EngineInner<S> {
    pub(crate) fn new(config: MemDbConfig, store: S) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(EngineState::default()),
            metrics: EngineMetrics::new(),
            stopped: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }
}

// ============================================================================
// ENGINE FACADE
// ============================================================================

/// Hybrid write-back cache over a durable document store.
///
/// Writes are absorbed in memory and drained to the store by the flush
/// pipeline; reads are served from memory when present and otherwise
/// loaded through with single-flight deduplication. See the crate docs
/// for the full contract.
pub struct MemDb<S: StoreBackend> {
    inner: Arc<EngineInner<S>>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl MemDb<PgStore> {
    /// Open a PostgreSQL-backed engine and start its background tasks.
    pub async fn connect(config: MemDbConfig) -> MemDbResult<Self> {
        config.validate()?;
        let store = PgStore::connect(&config).await?;
        let db = Self::new(config, store)?;
        db.start()?;
        Ok(db)
    }
}

impl<S: StoreBackend + 'static> MemDb<S> {
    /// Create an engine over an already-opened store.
    ///
    /// Background tasks are not running until [`MemDb::start`].
    pub fn new(config: MemDbConfig, store: S) -> MemDbResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner::new(config, store)),
            tasks: Mutex::new(None),
        })
    }

    /// Start the background flush and eviction tasks.
    ///
    /// Idempotent while running. Must be called within a tokio runtime.
    pub fn start(&self) -> MemDbResult<()> {
        self.ensure_running()?;
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Ok(());
        }
        *tasks = Some(spawn_background_tasks(Arc::clone(&self.inner)));
        tracing::info!(
            flush_interval_secs = self.inner.config.flush_interval.as_secs(),
            evict_interval_secs = self.inner.config.evict_interval.as_secs(),
            max_connections = self.inner.config.max_connections,
            "engine started"
        );
        Ok(())
    }

    /// Stop the engine: cancel background tasks, run a final flush of
    /// every dirty entry, and release the store.
    ///
    /// Returns the number of entries still dirty after the final flush
    /// (zero unless the store failed during shutdown). Public
    /// operations begun after this call return [`MemDbError::EngineStopped`].
    pub async fn stop(&self) -> MemDbResult<usize> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Err(MemDbError::EngineStopped);
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let grace = self
                .inner
                .config
                .flush_interval
                .max(self.inner.config.evict_interval)
                + Duration::from_secs(1);
            tasks.shutdown(grace).await;
        }

        let report = flush_pass(&self.inner, None).await;
        let residual = self.inner.state.lock().index.dirty_len();
        if residual > 0 {
            tracing::warn!(
                residual,
                failed = report.failed,
                "dirty records remain after final flush"
            );
        } else {
            tracing::info!(persisted = report.persisted, "final flush complete");
        }

        self.inner.store.close().await;
        tracing::info!("engine stopped");
        Ok(residual)
    }

    /// Register a table and ensure its backing relation exists.
    pub async fn create_table(&self, table: &str, schema_hint: Document) -> MemDbResult<()> {
        self.ensure_running()?;
        if table.is_empty() {
            return Err(MemDbError::invalid_argument("table name must not be empty"));
        }

        self.inner
            .store
            .ensure_table(table, &schema_hint)
            .await
            .map_err(|e| {
                self.inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                MemDbError::from(e)
            })?;

        let mut state = self.inner.state.lock();
        state.tables.insert(table.to_string(), schema_hint);
        state.bootstrapped.insert(table.to_string());
        state.quarantined.remove(table);
        Ok(())
    }

    /// Write a document into the cache, memory-first.
    ///
    /// Never touches the store; durability is deferred to the flush
    /// pipeline. Unknown tables are registered lazily and bootstrapped
    /// by the first flush that carries them.
    pub fn insert(&self, table: &str, key: &str, document: Document) -> MemDbResult<()> {
        self.ensure_running()?;
        validate_address(table, key)?;
        validate_document(&document)?;

        {
            let mut state = self.inner.state.lock();
            if !state.tables.contains_key(table) {
                state.tables.insert(table.to_string(), json!({}));
            }
            state.index.put(table, key, document, true);
        }
        self.inner.metrics.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Alias of [`MemDb::insert`]: writes replace whole documents.
    pub fn upsert(&self, table: &str, key: &str, document: Document) -> MemDbResult<()> {
        self.insert(table, key, document)
    }

    /// Read a document, serving from memory when present.
    ///
    /// On a miss with `use_cache`, loads from the store (single-flight
    /// per key) and caches the result clean. With `use_cache` false the
    /// call bypasses the cache entirely in both directions.
    pub async fn get(
        &self,
        table: &str,
        key: &str,
        use_cache: bool,
    ) -> MemDbResult<Option<Document>> {
        self.ensure_running()?;

        enum MissPath {
            UnknownTable,
            Direct,
            Wait(watch::Receiver<Option<LoadOutcome>>),
            Load(watch::Sender<Option<LoadOutcome>>),
        }

        let addr = (table.to_string(), key.to_string());
        let path = {
            let mut state = self.inner.state.lock();
            if use_cache {
                if let Some(doc) = state.index.get_document(table, key) {
                    self.inner.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(doc));
                }
            }
            self.inner.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

            if !state.tables.contains_key(table) {
                MissPath::UnknownTable
            } else if !use_cache {
                MissPath::Direct
            } else if let Some(rx) = state.in_flight.get(&addr) {
                MissPath::Wait(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.in_flight.insert(addr.clone(), rx);
                MissPath::Load(tx)
            }
        };

        match path {
            MissPath::UnknownTable => Ok(None),

            MissPath::Direct => self.inner.store.fetch(table, key).await.map_err(|e| {
                self.inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                MemDbError::from(e)
            }),

            MissPath::Wait(mut rx) => loop {
                let settled = rx.borrow().clone();
                if let Some(outcome) = settled {
                    return outcome.map_err(MemDbError::from);
                }
                if rx.changed().await.is_err() {
                    return Err(StoreError::Unavailable {
                        reason: "cache load interrupted".to_string(),
                    }
                    .into());
                }
            },

            MissPath::Load(tx) => {
                let fetched = self.inner.store.fetch(table, key).await;

                let outcome: LoadOutcome = {
                    let mut state = self.inner.state.lock();
                    state.in_flight.remove(&addr);
                    match fetched {
                        Ok(loaded) => {
                            if let Some(doc) = state.index.get_document(table, key) {
                                // A write landed while the load was in
                                // flight; it supersedes the store image.
                                Ok(Some(doc))
                            } else if let Some(doc) = loaded {
                                state.index.put(table, key, doc.clone(), false);
                                Ok(Some(doc))
                            } else {
                                Ok(None)
                            }
                        }
                        Err(e) => {
                            self.inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                            Err(e)
                        }
                    }
                };

                let _ = tx.send(Some(outcome.clone()));
                outcome.map_err(MemDbError::from)
            }
        }
    }

    /// Forward a predicate query to the store. No cache interaction.
    pub async fn query(
        &self,
        table: &str,
        predicate: &str,
        limit: usize,
    ) -> MemDbResult<Vec<Document>> {
        self.ensure_running()?;

        let known = self.inner.state.lock().tables.contains_key(table);
        if !known {
            return Ok(Vec::new());
        }

        self.inner
            .store
            .query(table, predicate, limit)
            .await
            .map_err(|e| {
                self.inner.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                MemDbError::from(e)
            })
    }

    /// Run one flush pass synchronously over `table`, or all tables.
    ///
    /// Errors only when every attempted batch failed wholesale; partial
    /// failures are reported in the [`FlushReport`] and retried by the
    /// next tick.
    pub async fn flush(&self, table: Option<&str>) -> MemDbResult<FlushReport> {
        self.ensure_running()?;
        let report = flush_pass(&self.inner, table).await;
        if report.all_failed() {
            return Err(StoreError::Unavailable {
                reason: format!("all {} flush batches failed", report.batches),
            }
            .into());
        }
        Ok(report)
    }

    /// Run one eviction pass synchronously. Returns entries removed.
    pub fn evict_idle(&self) -> MemDbResult<usize> {
        self.ensure_running()?;
        Ok(evict_pass(&self.inner))
    }

    /// Point-in-time statistics. Gauges are exact at the moment of the
    /// call; counters are monotonic.
    pub fn stats(&self) -> StatsSnapshot {
        let (cached_records, dirty_records, tables) = {
            let state = self.inner.state.lock();
            (
                state.index.len(),
                state.index.dirty_len(),
                state.tables.len(),
            )
        };
        let uptime_secs = (Utc::now() - self.inner.started_at).num_seconds();
        self.inner
            .metrics
            .snapshot(cached_records, dirty_records, tables, uptime_secs)
    }

    /// Access the underlying store adapter.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    fn ensure_running(&self) -> MemDbResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            Err(MemDbError::EngineStopped)
        } else {
            Ok(())
        }
    }
}
