//! PostgreSQL store adapter.
//!
//! Documents live in per-table JSONB relations named `memdb_<table>`:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS memdb_<table> (
//!     key        TEXT PRIMARY KEY,
//!     data       JSONB NOT NULL,
//!     created_at TIMESTAMPTZ DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ DEFAULT NOW()
//! );
//! ```
//!
//! plus a GIN index on `data` so pass-through predicate queries over
//! JSON paths stay off sequential scans. Connections come from a
//! deadpool pool bounded by `max_connections`; every operation checks
//! out one connection for as short as possible.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use memdb_core::{Document, MemDbConfig, StoreError, StoreResult, KEY_FIELD};
use serde_json::Value as JsonValue;
use tokio_postgres::NoTls;

use crate::backend::{BatchOutcome, StoreBackend};

/// Longest logical table name we accept; the physical name must fit
/// PostgreSQL's 63-byte identifier limit after prefixing.
const MAX_TABLE_NAME_LEN: usize = 56;

const TABLE_PREFIX: &str = "memdb_";

/// PostgreSQL-backed [`StoreBackend`].
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    op_timeout: Option<Duration>,
}

impl PgStore {
    /// Open a pool for the configured store and verify one checkout.
    ///
    /// A bad DSN or unreachable server fails here with
    /// [`StoreError::Unavailable`] rather than on the first flush tick.
    pub async fn connect(config: &MemDbConfig) -> StoreResult<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(config.db_url.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_connections));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable {
                reason: format!("failed to create pool: {e}"),
            })?;

        // Verify connectivity before handing the pool to the engine.
        pool.get().await.map_err(|e| StoreError::Unavailable {
            reason: format!("failed to open connection: {e}"),
        })?;

        tracing::info!(max_connections = config.max_connections, "store pool opened");

        Ok(Self {
            pool,
            op_timeout: None,
        })
    }

    /// Attach a per-call deadline to every store operation.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    async fn get_conn(&self) -> StoreResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| StoreError::Unavailable {
            reason: format!("connection checkout failed: {e}"),
        })
    }

    /// Run a store future under the configured deadline, if any.
    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match self.op_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    waited_ms: limit.as_millis() as u64,
                }),
            },
            None => fut.await,
        }
    }
}

/// Map a logical table name to its physical relation name.
///
/// The name is spliced into DDL and query text, so the charset is
/// restricted to identifier-safe characters up front.
pub fn physical_table_name(table: &str) -> StoreResult<String> {
    if table.is_empty() || table.len() > MAX_TABLE_NAME_LEN {
        return Err(StoreError::Schema {
            table: table.to_string(),
            reason: format!("table name must be 1..={MAX_TABLE_NAME_LEN} characters"),
        });
    }
    if !table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::Schema {
            table: table.to_string(),
            reason: "table name may contain only ASCII alphanumerics and '_'".to_string(),
        });
    }
    Ok(format!("{TABLE_PREFIX}{table}"))
}

#[async_trait]
impl StoreBackend for PgStore {
    async fn ensure_table(&self, table: &str, _schema_hint: &Document) -> StoreResult<()> {
        let physical = physical_table_name(table)?;
        self.with_deadline(async {
            let conn = self.get_conn().await?;

            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {physical} (\
                 key TEXT PRIMARY KEY, \
                 data JSONB NOT NULL, \
                 created_at TIMESTAMPTZ DEFAULT NOW(), \
                 updated_at TIMESTAMPTZ DEFAULT NOW())"
            );
            conn.execute(ddl.as_str(), &[])
                .await
                .map_err(|e| StoreError::Schema {
                    table: table.to_string(),
                    reason: format!("create table failed: {e}"),
                })?;

            let index_ddl = format!(
                "CREATE INDEX IF NOT EXISTS idx_{physical}_data \
                 ON {physical} USING GIN (data)"
            );
            conn.execute(index_ddl.as_str(), &[])
                .await
                .map_err(|e| StoreError::Schema {
                    table: table.to_string(),
                    reason: format!("create index failed: {e}"),
                })?;

            tracing::info!(table, physical = %physical, "ensured backing table");
            Ok(())
        })
        .await
    }

    async fn fetch(&self, table: &str, key: &str) -> StoreResult<Option<Document>> {
        let physical = physical_table_name(table)?;
        self.with_deadline(async {
            let conn = self.get_conn().await?;

            let sql = format!("SELECT data FROM {physical} WHERE key = $1");
            let row = conn
                .query_opt(sql.as_str(), &[&key])
                .await
                .map_err(|e| StoreError::Unavailable {
                    reason: format!("fetch failed: {e}"),
                })?;

            Ok(row.map(|r| r.get::<_, JsonValue>(0)))
        })
        .await
    }

    async fn upsert_batch(
        &self,
        table: &str,
        items: &[(String, Document)],
    ) -> StoreResult<BatchOutcome> {
        if items.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let physical = physical_table_name(table)?;
        self.with_deadline(async {
            let conn = self.get_conn().await?;

            let sql = format!(
                "INSERT INTO {physical} (key, data, updated_at) \
                 VALUES ($1, $2, NOW()) \
                 ON CONFLICT (key) DO UPDATE \
                 SET data = EXCLUDED.data, updated_at = NOW()"
            );

            let mut outcome = BatchOutcome::default();
            let mut remaining = items.iter();
            while let Some((key, doc)) = remaining.next() {
                match conn.execute(sql.as_str(), &[key, doc]).await {
                    Ok(_) => outcome.acknowledged.push(key.clone()),
                    Err(e) => {
                        let closed = e.is_closed();
                        outcome.failed.push((
                            key.clone(),
                            StoreError::Unavailable {
                                reason: format!("upsert failed: {e}"),
                            },
                        ));
                        if closed {
                            // The connection died; nothing further on it
                            // can succeed this call.
                            for (key, _) in remaining.by_ref() {
                                outcome.failed.push((
                                    key.clone(),
                                    StoreError::Unavailable {
                                        reason: "connection closed mid-batch".to_string(),
                                    },
                                ));
                            }
                            break;
                        }
                    }
                }
            }

            Ok(outcome)
        })
        .await
    }

    async fn query(
        &self,
        table: &str,
        predicate: &str,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let physical = physical_table_name(table)?;
        self.with_deadline(async {
            let conn = self.get_conn().await?;

            let mut sql = format!("SELECT key, data FROM {physical}");
            if !predicate.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(predicate);
            }
            sql.push_str(&format!(" LIMIT {limit}"));

            let rows = conn.query(sql.as_str(), &[]).await.map_err(|e| StoreError::Query {
                table: table.to_string(),
                reason: e.to_string(),
            })?;

            Ok(rows
                .iter()
                .map(|row| {
                    let key: String = row.get(0);
                    let mut doc: JsonValue = row.get(1);
                    if let Some(map) = doc.as_object_mut() {
                        map.insert(KEY_FIELD.to_string(), JsonValue::String(key));
                    }
                    doc
                })
                .collect())
        })
        .await
    }

    async fn close(&self) {
        self.pool.close();
        tracing::info!("store pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_table_name_prefixes() {
        assert_eq!(physical_table_name("users").unwrap(), "memdb_users");
        assert_eq!(physical_table_name("audit_log2").unwrap(), "memdb_audit_log2");
    }

    #[test]
    fn test_physical_table_name_rejects_unsafe_identifiers() {
        for bad in ["", "users; DROP TABLE x", "a-b", "a b", "naïve", &"x".repeat(57)] {
            assert!(
                matches!(physical_table_name(bad), Err(StoreError::Schema { .. })),
                "expected rejection for {bad:?}"
            );
        }
    }
}
