//! MEMDB Engine - hybrid write-back cache over a durable document store
//!
//! Clients address schema-flexible JSON documents by `(table, key)`.
//! Writes are absorbed by an in-memory index and drained to the store
//! in batches by a background flush task; clean entries idle past a TTL
//! are evicted by a background eviction task; reads are served from
//! memory when present and otherwise loaded through with single-flight
//! deduplication per key.
//!
//! The engine guarantees, among others:
//!
//! - read-your-writes within the process: a `get` after an `insert`
//!   observes the inserted document;
//! - at-most-once-loss: a dirty entry is never evicted before the store
//!   has acknowledged its exact document;
//! - drain-on-shutdown: `stop()` runs a final flush so no entry is left
//!   dirty when the store is reachable.
//!
//! # Example
//!
//! ```ignore
//! use memdb_core::MemDbConfig;
//! use memdb_engine::MemDb;
//! use serde_json::json;
//!
//! let db = MemDb::connect(MemDbConfig::from_env()?).await?;
//! db.create_table("users", json!({"name": "string"})).await?;
//! db.insert("users", "alice", json!({"name": "Alice"}))?;
//! let doc = db.get("users", "alice", true).await?;
//! db.stop().await?;
//! ```

mod engine;
mod evict;
mod flush;
mod index;
mod stats;
mod tasks;

pub use engine::MemDb;
pub use flush::FlushReport;
pub use stats::StatsSnapshot;

pub use memdb_core::{Document, MemDbConfig, MemDbError, MemDbResult, StoreError};
pub use memdb_store::{BatchOutcome, MemoryStore, PgStore, StoreBackend};
