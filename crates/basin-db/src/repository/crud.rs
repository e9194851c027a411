//! # CRUD Log Repository
//!
//! Reads the outbound log filled by the view triggers and drains it once
//! the application server has accepted a transaction.
//!
//! ## Life of an Entry
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  INSERT INTO users ...        (view trigger)                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ps_crud (id AUTOINCREMENT, tx_id, data)                                │
//! │  ps_buckets['$local'].target_op = MAX        ← sync data now deferred   │
//! │       │                                                                 │
//! │       │  next_transaction()                                             │
//! │       ▼                                                                 │
//! │  CrudTransaction { crud: [entries sharing tx_id] }                      │
//! │       │                                                                 │
//! │       │  connector uploads, then complete(write_checkpoint)             │
//! │       ▼                                                                 │
//! │  DELETE FROM ps_crud WHERE id <= last client_id                         │
//! │  log empty + checkpoint given ? target_op = checkpoint : MAX            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

use basin_core::{CrudEntry, OpId, UploadQueueStats, LOCAL_BUCKET};

use crate::error::{DbError, DbResult};
use crate::pool::ConnectionPool;

const CLIENT_ID_KEY: &str = "client_id";

// =============================================================================
// Completion
// =============================================================================

/// Shared "drain up to here" action behind transactions and batches.
struct Completion {
    pool: Arc<ConnectionPool>,
    last_client_id: i64,
    done: AtomicBool,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("last_client_id", &self.last_client_id)
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}

impl Completion {
    fn new(pool: Arc<ConnectionPool>, last_client_id: i64) -> Arc<Self> {
        Arc::new(Completion {
            pool,
            last_client_id,
            done: AtomicBool::new(false),
        })
    }

    async fn complete(&self, write_checkpoint: Option<String>) -> DbResult<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            debug!(last_client_id = self.last_client_id, "CRUD entries already completed");
            return Ok(());
        }

        let target = write_checkpoint.as_deref().map(str::parse::<OpId>).transpose()?;
        let last = self.last_client_id;
        let result = self
            .pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM ps_crud WHERE id <= ?1")
                        .bind(last)
                        .execute(&mut *conn)
                        .await?;

                    let drained = !has_crud(conn).await?;
                    let target = match target {
                        Some(op) if drained => op,
                        _ => OpId::MAX,
                    };
                    set_local_target(conn, target).await
                })
            })
            .await;

        match result {
            Ok(()) => {
                info!(
                    last_client_id = last,
                    write_checkpoint = ?write_checkpoint,
                    "CRUD entries completed"
                );
                Ok(())
            }
            Err(e) => {
                // Allow a retry after a failed attempt.
                self.done.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Transactions and batches
// =============================================================================

/// Entries written by one local transaction, in `client_id` order.
#[derive(Debug, Clone)]
pub struct CrudTransaction {
    /// `None` for an entry written outside of a grouped transaction.
    pub transaction_id: Option<i64>,
    pub crud: Vec<CrudEntry>,
    completion: Arc<Completion>,
}

impl CrudTransaction {
    /// Removes these entries from the log.
    ///
    /// Only the first call touches storage; later calls return `Ok(())`.
    /// A failed call can be retried.
    ///
    /// ## Arguments
    /// * `write_checkpoint` - Server write checkpoint covering this upload.
    ///   Local rows stay shadowed until sync reaches it.
    pub async fn complete(&self, write_checkpoint: Option<String>) -> DbResult<()> {
        self.completion.complete(write_checkpoint).await
    }

    pub fn is_completed(&self) -> bool {
        self.completion.done.load(Ordering::SeqCst)
    }

    /// `client_id` of the newest entry.
    pub fn last_client_id(&self) -> i64 {
        self.completion.last_client_id
    }
}

/// Up to `limit` entries regardless of transaction boundaries.
#[derive(Debug, Clone)]
pub struct CrudBatch {
    pub crud: Vec<CrudEntry>,
    pub has_more: bool,
    completion: Arc<Completion>,
}

impl CrudBatch {
    pub async fn complete(&self, write_checkpoint: Option<String>) -> DbResult<()> {
        self.completion.complete(write_checkpoint).await
    }

    pub fn is_completed(&self) -> bool {
        self.completion.done.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the outbound CRUD log.
#[derive(Debug, Clone)]
pub struct CrudRepository {
    pool: Arc<ConnectionPool>,
}

impl CrudRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        CrudRepository { pool }
    }

    /// Oldest pending transaction, if any.
    ///
    /// An entry without a transaction id forms a transaction by itself.
    pub async fn next_transaction(&self) -> DbResult<Option<CrudTransaction>> {
        let pool = self.pool.clone();
        let found = self
            .pool
            .read_transaction(|conn| {
                Box::pin(async move {
                    let first = sqlx::query("SELECT id, tx_id, data FROM ps_crud ORDER BY id LIMIT 1")
                        .fetch_optional(&mut *conn)
                        .await?;
                    let Some(first) = first else {
                        return Ok(None);
                    };

                    let tx_id: Option<i64> = first.get("tx_id");
                    let entries = match tx_id {
                        None => vec![entry_from_row(&first)?],
                        Some(tx_id) => {
                            let rows = sqlx::query(
                                "SELECT id, tx_id, data FROM ps_crud WHERE tx_id = ?1 ORDER BY id",
                            )
                            .bind(tx_id)
                            .fetch_all(&mut *conn)
                            .await?;
                            rows.iter().map(entry_from_row).collect::<DbResult<Vec<_>>>()?
                        }
                    };
                    Ok(Some((tx_id, entries)))
                })
            })
            .await?;

        Ok(found.and_then(|(transaction_id, crud)| {
            let last = crud.last()?.client_id;
            Some(CrudTransaction {
                transaction_id,
                crud,
                completion: Completion::new(pool, last),
            })
        }))
    }

    /// Oldest `limit` entries.
    pub async fn batch(&self, limit: usize) -> DbResult<Option<CrudBatch>> {
        let fetch = i64::try_from(limit).unwrap_or(i64::MAX).saturating_add(1);
        let mut crud = self
            .pool
            .read(move |conn| {
                Box::pin(async move {
                    let rows = sqlx::query("SELECT id, tx_id, data FROM ps_crud ORDER BY id LIMIT ?1")
                        .bind(fetch)
                        .fetch_all(&mut *conn)
                        .await?;
                    rows.iter().map(entry_from_row).collect::<DbResult<Vec<_>>>()
                })
            })
            .await?;

        let has_more = crud.len() > limit;
        crud.truncate(limit);
        let Some(last) = crud.last().map(|e| e.client_id) else {
            return Ok(None);
        };
        Ok(Some(CrudBatch {
            crud,
            has_more,
            completion: Completion::new(self.pool.clone(), last),
        }))
    }

    pub async fn has_crud(&self) -> DbResult<bool> {
        self.pool
            .read(|conn| Box::pin(async move { has_crud(conn).await }))
            .await
    }

    /// Number of pending entries, and their payload size when asked.
    pub async fn stats(&self, include_size: bool) -> DbResult<UploadQueueStats> {
        self.pool
            .read(move |conn| {
                Box::pin(async move {
                    let row = sqlx::query("SELECT COUNT(*), SUM(LENGTH(data)) FROM ps_crud")
                        .fetch_one(&mut *conn)
                        .await?;
                    let count: i64 = row.get(0);
                    let size = include_size.then(|| row.get::<Option<i64>, _>(1).unwrap_or(0));
                    Ok(UploadQueueStats { count, size })
                })
            })
            .await
    }

    /// Stable id of this database, generated on first use.
    pub async fn client_id(&self) -> DbResult<String> {
        let existing = self
            .pool
            .read(|conn| Box::pin(async move { read_client_id(conn).await }))
            .await?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let candidate = Uuid::new_v4().to_string();
        self.pool
            .write(move |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT OR IGNORE INTO ps_kv (key, value) VALUES (?1, ?2)")
                        .bind(CLIENT_ID_KEY)
                        .bind(&candidate)
                        .execute(&mut *conn)
                        .await?;
                    read_client_id(conn)
                        .await?
                        .ok_or_else(|| DbError::Internal("client id missing after insert".into()))
                })
            })
            .await
    }

    /// Moves the `$local` target from "unknown" to a real write checkpoint
    /// once everything has been uploaded.
    ///
    /// `fetch` is only called when the target is unknown and the log is
    /// empty. The fetched checkpoint is discarded if a local write happened
    /// while it was being fetched.
    ///
    /// ## Returns
    /// `true` if the target was updated.
    pub async fn update_local_target<F, Fut, E>(&self, fetch: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: From<DbError>,
    {
        let observed = self
            .pool
            .read(|conn| {
                Box::pin(async move {
                    let target: Option<i64> =
                        sqlx::query_scalar("SELECT target_op FROM ps_buckets WHERE name = ?1")
                            .bind(LOCAL_BUCKET)
                            .fetch_optional(&mut *conn)
                            .await?;
                    if target != Some(OpId::MAX.value()) || has_crud(conn).await? {
                        return Ok(None);
                    }
                    Ok(Some(crud_sequence(conn).await?))
                })
            })
            .await?;

        let Some(sequence) = observed else {
            return Ok(false);
        };

        let write_checkpoint: OpId = fetch().await?.parse().map_err(DbError::from)?;

        let updated = self
            .pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    if has_crud(conn).await? || crud_sequence(conn).await? != sequence {
                        return Ok(false);
                    }
                    set_local_target(conn, write_checkpoint).await?;
                    Ok(true)
                })
            })
            .await?;

        if updated {
            info!(write_checkpoint = %write_checkpoint, "Local write target set");
        } else {
            debug!("Local writes happened while fetching the write checkpoint");
        }
        Ok(updated)
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> DbResult<CrudEntry> {
    let data: String = row.get("data");
    Ok(CrudEntry::from_row(row.get("id"), row.get("tx_id"), &data)?)
}

async fn has_crud(conn: &mut SqliteConnection) -> DbResult<bool> {
    Ok(sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ps_crud)")
        .fetch_one(&mut *conn)
        .await?)
}

async fn crud_sequence(conn: &mut SqliteConnection) -> DbResult<i64> {
    let seq: Option<i64> =
        sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = 'ps_crud'")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(seq.unwrap_or(0))
}

async fn set_local_target(conn: &mut SqliteConnection, target: OpId) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ps_buckets (name, target_op) VALUES (?1, ?2)
        ON CONFLICT (name) DO UPDATE SET target_op = excluded.target_op
        "#,
    )
    .bind(LOCAL_BUCKET)
    .bind(target.value())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_client_id(conn: &mut SqliteConnection) -> DbResult<Option<String>> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM ps_kv WHERE key = ?1")
        .bind(CLIENT_ID_KEY)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value.flatten())
}
