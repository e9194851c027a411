//! # Database
//!
//! The object applications hold: one pool, one registry slot, the
//! application schema and the repositories built on top of them.
//!
//! ## Opening
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database::open(options, registry)                                      │
//! │       │                                                                 │
//! │       ├── registry.reference(identifier)   warns on a second instance   │
//! │       ├── ConnectionPool::lazy(options.pool)                            │
//! │       └── write_transaction(apply_schema)  first open + migrations      │
//! │                                                                         │
//! │  db.close()   pool closed, registry slot released                       │
//! │  drop(db)     registry slot released                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use basin_core::UploadQueueStats;

use crate::error::DbResult;
use crate::params::{bind_params, from_row, row_to_json, SqlParam};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{InstanceHandle, InstanceRegistry};
use crate::repository::{BucketStorage, CrudBatch, CrudRepository, CrudTransaction};
use crate::schema::{apply_schema, quote_ident, Schema};
use crate::watch::{self, WatchedQuery, DEFAULT_THROTTLE};

/// Options for [`Database::open`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub pool: PoolConfig,
    pub schema: Schema,
    /// Registry key. Defaults to the database path.
    pub identifier: Option<String>,
    /// Default throttle of [`Database::watch`].
    pub watch_throttle: Duration,
}

impl DatabaseOptions {
    pub fn new(pool: PoolConfig, schema: Schema) -> Self {
        DatabaseOptions {
            pool,
            schema,
            identifier: None,
            watch_throttle: DEFAULT_THROTTLE,
        }
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn watch_throttle(mut self, throttle: Duration) -> Self {
        self.watch_throttle = throttle;
        self
    }
}

/// A local-first database.
#[derive(Debug)]
pub struct Database {
    pool: Arc<ConnectionPool>,
    schema: Schema,
    instance: InstanceHandle,
    buckets: BucketStorage,
    crud: CrudRepository,
    watch_throttle: Duration,
}

impl Database {
    /// Opens the database and applies `options.schema`.
    ///
    /// Unlike a bare [`ConnectionPool`], which opens on its first lease, this
    /// opens the file and creates the views before returning. An unreadable
    /// path or an invalid schema fails here rather than on the first query.
    ///
    /// The pool shares the registry's write lock for its identifier, so
    /// writes from several instances of one file never overlap.
    pub async fn open(options: DatabaseOptions, registry: &InstanceRegistry) -> DbResult<Self> {
        options.schema.validate()?;

        let identifier = options.identifier.clone().unwrap_or_else(|| {
            if options.pool.in_memory {
                // Every in-memory database is its own storage.
                format!("memory:{}", Uuid::new_v4())
            } else {
                options.pool.path.display().to_string()
            }
        });
        let instance = registry.reference(identifier);

        let pool = Arc::new(
            ConnectionPool::lazy(options.pool).with_shared_write_lock(instance.write_lock()),
        );
        let schema = options.schema;
        let to_apply = schema.clone();
        pool.write_transaction(move |conn| {
            Box::pin(async move { apply_schema(conn, &to_apply).await })
        })
        .await?;

        info!(identifier = %instance.identifier(), "Database ready");

        Ok(Database {
            buckets: BucketStorage::new(pool.clone()),
            crud: CrudRepository::new(pool.clone()),
            pool,
            schema,
            instance,
            watch_throttle: options.watch_throttle,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn instance(&self) -> &InstanceHandle {
        &self.instance
    }

    pub fn bucket_storage(&self) -> &BucketStorage {
        &self.buckets
    }

    pub fn crud(&self) -> &CrudRepository {
        &self.crud
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Runs one statement in its own write transaction.
    ///
    /// ## Returns
    /// Number of rows affected. SQLite reports 0 for statements on views,
    /// which `INSTEAD OF` triggers carry out.
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<SqlParam>) -> DbResult<u64> {
        let sql = sql.into();
        self.write_transaction(move |conn| {
            Box::pin(async move {
                let done = bind_params(sqlx::query(&sql), &params)
                    .execute(&mut *conn)
                    .await?;
                Ok(done.rows_affected())
            })
        })
        .await
    }

    /// Every row of `sql` as a JSON object.
    pub async fn get_all(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> DbResult<Vec<Map<String, Value>>> {
        let rows = self.fetch_rows(sql.into(), params).await?;
        rows.iter().map(row_to_json).collect()
    }

    /// Every row of `sql` deserialized into `T`.
    pub async fn get_all_as<T: DeserializeOwned>(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> DbResult<Vec<T>> {
        let rows = self.fetch_rows(sql.into(), params).await?;
        rows.iter().map(from_row).collect()
    }

    /// First row of `sql`, if any.
    pub async fn get_optional(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> DbResult<Option<Map<String, Value>>> {
        let sql = sql.into();
        let row = self
            .pool
            .read(move |conn| {
                Box::pin(async move {
                    Ok(bind_params(sqlx::query(&sql), &params)
                        .fetch_optional(&mut *conn)
                        .await?)
                })
            })
            .await?;
        row.as_ref().map(row_to_json).transpose()
    }

    async fn fetch_rows(&self, sql: String, params: Vec<SqlParam>) -> DbResult<Vec<SqliteRow>> {
        self.pool
            .read(move |conn| {
                Box::pin(async move {
                    Ok(bind_params(sqlx::query(&sql), &params)
                        .fetch_all(&mut *conn)
                        .await?)
                })
            })
            .await
    }

    /// Runs `f` on a reader inside a transaction.
    pub async fn read_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.pool.read_transaction(f).await
    }

    /// Runs `f` in a write transaction. CRUD entries recorded by `f` share
    /// one transaction id and are uploaded together.
    pub async fn write_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    sqlx::query(
                        "UPDATE ps_tx SET current_tx = next_tx, next_tx = next_tx + 1 WHERE id = 1",
                    )
                    .execute(&mut *conn)
                    .await?;
                    let value = f(&mut *conn).await?;
                    sqlx::query("UPDATE ps_tx SET current_tx = NULL WHERE id = 1")
                        .execute(&mut *conn)
                        .await?;
                    Ok(value)
                })
            })
            .await
    }

    // =========================================================================
    // Watched queries
    // =========================================================================

    /// Live rows of `sql`, re-run when any of `tables` changes.
    pub fn watch(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
        tables: &[&str],
    ) -> WatchedQuery<Vec<SqliteRow>> {
        self.watch_with_throttle(sql, params, tables, self.watch_throttle)
    }

    pub fn watch_with_throttle(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
        tables: &[&str],
        throttle: Duration,
    ) -> WatchedQuery<Vec<SqliteRow>> {
        watch::watch_rows(self.pool.clone(), sql, params, owned(tables), throttle)
    }

    /// Like [`Database::watch`], mapping every row with `mapper`.
    pub fn watch_map<R, M>(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
        tables: &[&str],
        mapper: M,
    ) -> WatchedQuery<Vec<R>>
    where
        R: Send + 'static,
        M: Fn(&SqliteRow) -> DbResult<R> + Send + Sync + 'static,
    {
        watch::watch_map(
            self.pool.clone(),
            sql,
            params,
            owned(tables),
            self.watch_throttle,
            mapper,
        )
    }

    // =========================================================================
    // Upload queue
    // =========================================================================

    pub async fn next_crud_transaction(&self) -> DbResult<Option<CrudTransaction>> {
        self.crud.next_transaction().await
    }

    pub async fn crud_batch(&self, limit: usize) -> DbResult<Option<CrudBatch>> {
        self.crud.batch(limit).await
    }

    pub async fn upload_queue_stats(&self, include_size: bool) -> DbResult<UploadQueueStats> {
        self.crud.stats(include_size).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Deletes every synced row, the CRUD log and all bucket state.
    ///
    /// Local-only tables and the client id are kept.
    pub async fn disconnect_and_clear(&self) -> DbResult<()> {
        self.pool
            .write_transaction(|conn| {
                Box::pin(async move {
                    for table in [
                        "ps_oplog",
                        "ps_staging",
                        "ps_buckets",
                        "ps_crud",
                        "ps_updated_rows",
                        "ps_untyped",
                    ] {
                        // WHERE 1 keeps SQLite off the truncate path, which skips the update hook.
                        sqlx::query(&format!("DELETE FROM {table} WHERE 1"))
                            .execute(&mut *conn)
                            .await?;
                    }
                    sqlx::query("DELETE FROM ps_kv WHERE key != 'client_id'")
                        .execute(&mut *conn)
                        .await?;

                    let storage: Vec<String> = sqlx::query_scalar(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB 'ps_data__*'",
                    )
                    .fetch_all(&mut *conn)
                    .await?;
                    for table in storage {
                        sqlx::query(&format!("DELETE FROM {} WHERE 1", quote_ident(&table)))
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await?;

        info!(identifier = %self.instance.identifier(), "Local sync data cleared");
        Ok(())
    }

    /// Closes the pool and releases the registry slot. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
        self.instance.dispose();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn owned(tables: &[&str]) -> Vec<String> {
    tables.iter().map(|t| t.to_string()).collect()
}
