//! Document payload type and boundary validation.
//!
//! A document is an arbitrary JSON value stored opaquely under a
//! `(table, key)` address. The engine never inspects fields; the only
//! shape requirement is that documents accepted through the write path
//! are JSON objects, so they can round-trip a JSONB column unchanged.

use serde_json::Value;

use crate::{MemDbError, MemDbResult};

/// Opaque structured value stored under a single key.
pub type Document = Value;

/// Key under which `query` results carry the row's primary key.
pub const KEY_FIELD: &str = "_key";

/// Validate a caller-supplied document for the write path.
///
/// Only mappings are accepted; scalars and arrays cannot be addressed
/// field-wise by store-side predicate queries.
pub fn validate_document(doc: &Document) -> MemDbResult<()> {
    if doc.is_object() {
        Ok(())
    } else {
        Err(MemDbError::invalid_argument(
            "document must be a JSON object",
        ))
    }
}

/// Validate caller-supplied table and key names for the write path.
pub fn validate_address(table: &str, key: &str) -> MemDbResult<()> {
    if table.is_empty() {
        return Err(MemDbError::invalid_argument("table name must not be empty"));
    }
    if key.is_empty() {
        return Err(MemDbError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_documents_accepted() {
        assert!(validate_document(&json!({"name": "Alice", "age": 30})).is_ok());
        assert!(validate_document(&json!({})).is_ok());
        assert!(validate_document(&json!({"nested": {"deep": [1, 2, 3]}})).is_ok());
    }

    #[test]
    fn test_non_object_documents_rejected() {
        for doc in [json!(1), json!("text"), json!([1, 2]), json!(null), json!(true)] {
            assert!(matches!(
                validate_document(&doc),
                Err(MemDbError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn test_empty_address_rejected() {
        assert!(validate_address("users", "a").is_ok());
        assert!(validate_address("", "a").is_err());
        assert!(validate_address("users", "").is_err());
    }
}
