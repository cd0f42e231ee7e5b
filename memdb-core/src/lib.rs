//! MEMDB Core - shared types, errors, and configuration
//!
//! This crate holds everything the store adapters and the cache engine
//! agree on: the opaque [`Document`] payload type, the error taxonomy,
//! and the engine configuration. It performs no I/O.

pub mod config;
pub mod document;
pub mod error;

pub use config::MemDbConfig;
pub use document::{validate_address, validate_document, Document, KEY_FIELD};
pub use error::{MemDbError, MemDbResult, StoreError, StoreResult};
