//! MEMDB Store - durable store adapters
//!
//! The cache engine addresses its persistent store through the
//! [`StoreBackend`] capability set: ensure a backing table, fetch one
//! document, upsert a batch with per-item acknowledgement, and pass a
//! predicate query through untouched. [`PgStore`] is the PostgreSQL
//! implementation; [`MemoryStore`] is the in-memory fake used by the
//! engine's property and scenario tests.

pub mod backend;
pub mod memory;
pub mod postgres;

pub use backend::{BatchOutcome, StoreBackend};
pub use memory::MemoryStore;
pub use postgres::{physical_table_name, PgStore};
