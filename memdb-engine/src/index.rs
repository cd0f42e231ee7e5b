//! In-memory record index with dirty tracking.
//!
//! The index is the single source of truth for cached state. Every
//! entry carries a monotonic `version` counter, bumped on each mutation;
//! the flush protocol snapshots `(key, version, document)` triples under
//! the engine mutex, performs store I/O without it, and clears the dirty
//! flag afterwards only if the version is unchanged. A write that lands
//! between snapshot and reconcile therefore keeps its entry dirty for
//! the next flush tick.
//!
//! All methods here assume the caller holds the engine mutex; the type
//! itself carries no locking.

use std::collections::HashMap;
use std::time::Duration;

use memdb_core::Document;
use tokio::time::Instant;

/// One cached record.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub document: Document,
    pub dirty: bool,
    pub last_access: Instant,
    pub version: u64,
}

impl CacheEntry {
    fn new(document: Document, dirty: bool) -> Self {
        Self {
            document,
            dirty,
            last_access: Instant::now(),
            version: 1,
        }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

/// A dirty entry frozen at snapshot time.
///
/// Carries the document *value* captured with the mutex held, not a live
/// reference, so flush I/O observes a consistent image.
#[derive(Debug, Clone)]
pub(crate) struct DirtyRecord {
    pub table: String,
    pub key: String,
    pub version: u64,
    pub document: Document,
}

/// Mapping from `(table, key)` to cache entries.
#[derive(Debug, Default)]
pub(crate) struct RecordIndex {
    tables: HashMap<String, HashMap<String, CacheEntry>>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an entry.
    ///
    /// The dirty flag is sticky: replacing a dirty entry with
    /// `mark_dirty = false` keeps it dirty, because the previous
    /// mutation has still not been persisted. Returns the entry's new
    /// version.
    pub fn put(&mut self, table: &str, key: &str, document: Document, mark_dirty: bool) -> u64 {
        let entries = self.tables.entry(table.to_string()).or_default();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.document = document;
                entry.dirty = mark_dirty || entry.dirty;
                entry.version += 1;
                entry.touch();
                entry.version
            }
            None => {
                let entry = CacheEntry::new(document, mark_dirty);
                let version = entry.version;
                entries.insert(key.to_string(), entry);
                version
            }
        }
    }

    /// Return the entry's document, refreshing its idle clock.
    pub fn get_document(&mut self, table: &str, key: &str) -> Option<Document> {
        let entry = self.tables.get_mut(table)?.get_mut(key)?;
        entry.touch();
        Some(entry.document.clone())
    }

    /// Whether an entry exists for `(table, key)`. Does not touch.
    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.tables
            .get(table)
            .map(|t| t.contains_key(key))
            .unwrap_or(false)
    }

    /// Entry dirty flag, for reconciliation checks. Does not touch.
    pub fn is_dirty(&self, table: &str, key: &str) -> Option<bool> {
        self.tables.get(table)?.get(key).map(|e| e.dirty)
    }

    /// Entry version, for reconciliation checks. Does not touch.
    pub fn version(&self, table: &str, key: &str) -> Option<u64> {
        self.tables.get(table)?.get(key).map(|e| e.version)
    }

    /// Clear the dirty flag iff the entry still exists at the observed
    /// version. Returns whether the flag was cleared.
    pub fn clear_dirty_if_unchanged(
        &mut self,
        table: &str,
        key: &str,
        observed_version: u64,
    ) -> bool {
        let Some(entry) = self.tables.get_mut(table).and_then(|t| t.get_mut(key)) else {
            return false;
        };
        if entry.version != observed_version {
            return false;
        }
        entry.dirty = false;
        entry.touch();
        true
    }

    /// Frozen snapshot of dirty entries, optionally scoped to one table.
    pub fn snapshot_dirty(&self, scope: Option<&str>) -> Vec<DirtyRecord> {
        let mut records = Vec::new();
        for (table, entries) in &self.tables {
            if let Some(scope) = scope {
                if table != scope {
                    continue;
                }
            }
            for (key, entry) in entries {
                if entry.dirty {
                    records.push(DirtyRecord {
                        table: table.clone(),
                        key: key.clone(),
                        version: entry.version,
                        document: entry.document.clone(),
                    });
                }
            }
        }
        records
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&mut self, table: &str, key: &str) -> bool {
        match self.tables.get_mut(table) {
            Some(entries) => entries.remove(key).is_some(),
            None => false,
        }
    }

    /// Drop clean entries idle for at least `idle_for`. Dirty entries
    /// are skipped regardless of age. Returns the number removed.
    pub fn evict_idle(&mut self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for entries in self.tables.values_mut() {
            entries.retain(|_, entry| {
                let idle = now.saturating_duration_since(entry.last_access);
                let drop = !entry.dirty && idle >= idle_for;
                if drop {
                    evicted += 1;
                }
                !drop
            });
        }
        self.tables.retain(|_, entries| !entries.is_empty());
        evicted
    }

    /// Total number of cached entries.
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Number of entries currently dirty.
    pub fn dirty_len(&self) -> usize {
        self.tables
            .values()
            .flat_map(|t| t.values())
            .filter(|e| e.dirty)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_creates_dirty_entry() {
        let mut index = RecordIndex::new();
        let version = index.put("users", "a", json!({"n": "A"}), true);

        assert_eq!(version, 1);
        assert_eq!(index.is_dirty("users", "a"), Some(true));
        assert_eq!(index.get_document("users", "a"), Some(json!({"n": "A"})));
        assert_eq!(index.len(), 1);
        assert_eq!(index.dirty_len(), 1);
    }

    #[test]
    fn test_put_bumps_version_and_replaces_document() {
        let mut index = RecordIndex::new();
        index.put("users", "a", json!({"n": "A"}), true);
        let version = index.put("users", "a", json!({"n": "B"}), true);

        assert_eq!(version, 2);
        assert_eq!(index.get_document("users", "a"), Some(json!({"n": "B"})));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let mut index = RecordIndex::new();
        index.put("users", "a", json!({"n": "A"}), true);
        // A clean put over a dirty entry must not lose the pending write.
        index.put("users", "a", json!({"n": "B"}), false);
        assert_eq!(index.is_dirty("users", "a"), Some(true));
    }

    #[test]
    fn test_clear_dirty_requires_unchanged_version() {
        let mut index = RecordIndex::new();
        let snapshot_version = index.put("users", "a", json!({"n": "A"}), true);

        // Entry mutated after the snapshot: the clear must not apply.
        index.put("users", "a", json!({"n": "B"}), true);
        assert!(!index.clear_dirty_if_unchanged("users", "a", snapshot_version));
        assert_eq!(index.is_dirty("users", "a"), Some(true));

        // Clearing at the current version works.
        let current = index.version("users", "a").unwrap();
        assert!(index.clear_dirty_if_unchanged("users", "a", current));
        assert_eq!(index.is_dirty("users", "a"), Some(false));
    }

    #[test]
    fn test_clear_dirty_on_missing_entry_is_noop() {
        let mut index = RecordIndex::new();
        assert!(!index.clear_dirty_if_unchanged("users", "ghost", 1));
    }

    #[test]
    fn test_snapshot_dirty_scoping() {
        let mut index = RecordIndex::new();
        index.put("users", "a", json!({"n": "A"}), true);
        index.put("posts", "p", json!({"t": "T"}), true);
        index.put("users", "b", json!({"n": "B"}), false);

        let all = index.snapshot_dirty(None);
        assert_eq!(all.len(), 2);

        let users = index.snapshot_dirty(Some("users"));
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].key, "a");
        assert_eq!(users[0].version, 1);
    }

    #[test]
    fn test_snapshot_is_a_value_copy() {
        let mut index = RecordIndex::new();
        index.put("users", "a", json!({"n": "A"}), true);
        let snapshot = index.snapshot_dirty(None);

        index.put("users", "a", json!({"n": "B"}), true);
        assert_eq!(snapshot[0].document, json!({"n": "A"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_skips_dirty_and_fresh_entries() {
        let mut index = RecordIndex::new();
        index.put("users", "dirty", json!({"n": 1}), true);
        index.put("users", "clean_old", json!({"n": 2}), false);

        tokio::time::advance(Duration::from_secs(30)).await;
        index.put("users", "clean_fresh", json!({"n": 3}), false);

        let evicted = index.evict_idle(Duration::from_secs(30));
        assert_eq!(evicted, 1);
        assert!(!index.contains("users", "clean_old"));
        assert!(index.contains("users", "dirty"));
        assert!(index.contains("users", "clean_fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_document_refreshes_idle_clock() {
        let mut index = RecordIndex::new();
        index.put("users", "a", json!({"n": 1}), false);

        tokio::time::advance(Duration::from_secs(29)).await;
        index.get_document("users", "a");
        tokio::time::advance(Duration::from_secs(29)).await;

        // Accessed 29s ago; a 30s TTL must not evict it.
        assert_eq!(index.evict_idle(Duration::from_secs(30)), 0);
        assert!(index.contains("users", "a"));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Versions strictly increase across any sequence of puts.
        #[test]
        fn prop_version_strictly_increases(
            writes in proptest::collection::vec(0u32..100, 1..50)
        ) {
            let mut index = RecordIndex::new();
            let mut last_version = 0;
            for value in writes {
                let version = index.put("t", "k", json!({"v": value}), true);
                prop_assert!(version > last_version);
                last_version = version;
            }
        }

        /// Any number of writes to one key coalesce into exactly one
        /// dirty snapshot record carrying the latest document.
        #[test]
        fn prop_writes_coalesce_to_latest(
            writes in proptest::collection::vec(0u32..100, 1..50)
        ) {
            let mut index = RecordIndex::new();
            let last = *writes.last().unwrap();
            for value in &writes {
                index.put("t", "k", json!({"v": value}), true);
            }

            let snapshot = index.snapshot_dirty(None);
            prop_assert_eq!(snapshot.len(), 1);
            prop_assert_eq!(&snapshot[0].document, &json!({"v": last}));
            prop_assert_eq!(snapshot[0].version, writes.len() as u64);
        }

        /// A stale clear never clears; a current clear always does.
        #[test]
        fn prop_clear_dirty_race_detection(
            extra_writes in 0usize..5
        ) {
            let mut index = RecordIndex::new();
            let observed = index.put("t", "k", json!({"v": 0}), true);
            for i in 0..extra_writes {
                index.put("t", "k", json!({"v": i + 1}), true);
            }

            let cleared = index.clear_dirty_if_unchanged("t", "k", observed);
            prop_assert_eq!(cleared, extra_writes == 0);
            prop_assert_eq!(index.is_dirty("t", "k"), Some(extra_writes != 0));
        }
    }
}
