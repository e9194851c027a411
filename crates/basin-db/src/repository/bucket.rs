//! # Bucket Storage
//!
//! Staging, applying and validating replicated oplog data.
//!
//! ## Apply Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  data lines ──► save_sync_data ──► ps_staging                          │
//! │                                                                         │
//! │  checkpoint_complete ──► apply_checkpoint   (ONE write transaction)     │
//! │       │                                                                 │
//! │       │ 1. staging → ps_oplog in op_id order                            │
//! │       │      PUT/REMOVE supersede older ops for the same row            │
//! │       │      superseded checksums fold into add_checksum                │
//! │       │      CLEAR drops the bucket's oplog                             │
//! │       │                                                                 │
//! │       │ 2. add_checksum + Σ oplog.checksum  ==  declared?               │
//! │       │      no  ──► ROLLBACK, ChecksumMismatch { failed_buckets }      │
//! │       │                                                                 │
//! │       │ 3. last_op = max(last_op, checkpoint.last_op_id)                │
//! │       │                                                                 │
//! │       │ 4. local writes settled?                                        │
//! │       │      yes ──► materialize rows into ps_data__<type>              │
//! │       │      no  ──► remember rows in ps_updated_rows                   │
//! │       ▼                                                                 │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! "Settled" means the `$local` bucket has reached its target and the CRUD
//! log is empty, so synced data never overwrites a local write that the
//! server has not acknowledged yet.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use basin_core::{
    BucketPriority, BucketState, Checkpoint, Checksum, OpId, OpType, SyncDataBucket, LOCAL_BUCKET,
};

use crate::error::{DbError, DbResult};
use crate::pool::ConnectionPool;
use crate::schema::{quote_ident, DATA_PREFIX};

const LAST_SYNCED_AT: &str = "last_synced_at";

/// Result of a successful [`BucketStorage::apply_checkpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Operations moved from staging into the oplog.
    pub applied: usize,
    /// Whether rows were materialized. `false` means local writes are
    /// pending and the rows were deferred.
    pub ready: bool,
    /// Application tables whose rows changed.
    pub touched_tables: Vec<String>,
}

/// Repository for bucket replication state.
#[derive(Debug, Clone)]
pub struct BucketStorage {
    pool: Arc<ConnectionPool>,
}

impl BucketStorage {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        BucketStorage { pool }
    }

    /// Stages one `data` line. Nothing becomes visible until the next apply.
    pub async fn save_sync_data(&self, batch: SyncDataBucket) -> DbResult<()> {
        debug!(
            bucket = %batch.bucket,
            ops = batch.data.len(),
            has_more = batch.has_more,
            "Staging bucket data"
        );

        self.pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    ensure_bucket(conn, &batch.bucket).await?;
                    for op in &batch.data {
                        sqlx::query(
                            r#"
                            INSERT OR REPLACE INTO ps_staging
                                (bucket, op_id, op, row_type, row_id, subkey, data, checksum)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                            "#,
                        )
                        .bind(&batch.bucket)
                        .bind(op.op_id.value())
                        .bind(op.op.as_str())
                        .bind(&op.row_type)
                        .bind(&op.row_id)
                        .bind(&op.subkey)
                        .bind(&op.data)
                        .bind(op.checksum.as_i64())
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Last applied op id of every synced bucket.
    pub async fn bucket_states(&self) -> DbResult<Vec<BucketState>> {
        self.pool
            .read(|conn| {
                Box::pin(async move {
                    let rows = sqlx::query(
                        "SELECT name, last_op FROM ps_buckets WHERE name != ?1 ORDER BY name",
                    )
                    .bind(LOCAL_BUCKET)
                    .fetch_all(&mut *conn)
                    .await?;

                    Ok(rows
                        .iter()
                        .map(|row| BucketState {
                            bucket: row.get("name"),
                            op_id: OpId(row.get("last_op")),
                        })
                        .collect())
                })
            })
            .await
    }

    /// Records the target op and priority of every bucket in `checkpoint`.
    pub async fn set_target_checkpoint(&self, checkpoint: &Checkpoint) -> DbResult<()> {
        let checkpoint = checkpoint.clone();
        self.pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    for bucket in &checkpoint.checksums {
                        sqlx::query(
                            r#"
                            INSERT INTO ps_buckets (name, target_op, priority)
                            VALUES (?1, ?2, ?3)
                            ON CONFLICT (name) DO UPDATE SET
                                target_op = excluded.target_op,
                                priority = excluded.priority
                            "#,
                        )
                        .bind(&bucket.bucket)
                        .bind(checkpoint.last_op_id.value())
                        .bind(bucket.priority().0)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Applies staged data for `checkpoint`.
    ///
    /// ## Arguments
    /// * `checkpoint` - Target state with declared checksums
    /// * `priority` - `Some(p)` applies only buckets with priority ≤ p
    ///   (a partial checkpoint); `None` applies every bucket
    ///
    /// ## Errors
    /// `DbError::ChecksumMismatch` when any in-scope bucket disagrees with
    /// its declared checksum. Nothing is committed in that case.
    pub async fn apply_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<BucketPriority>,
    ) -> DbResult<ApplyOutcome> {
        let checkpoint = checkpoint.clone();
        let last_op_id = checkpoint.last_op_id;

        let outcome = self
            .pool
            .write_transaction(move |conn| {
                Box::pin(async move { apply_in_transaction(conn, &checkpoint, priority).await })
            })
            .await;

        match &outcome {
            Ok(o) => info!(
                last_op_id = %last_op_id,
                priority = ?priority,
                applied = o.applied,
                ready = o.ready,
                "Checkpoint applied"
            ),
            Err(DbError::ChecksumMismatch { failed_buckets }) => warn!(
                last_op_id = %last_op_id,
                buckets = ?failed_buckets,
                "Checksum mismatch, checkpoint rejected"
            ),
            Err(_) => {}
        }
        outcome
    }

    /// Drops every op of `buckets` so they sync again from op id zero.
    pub async fn reset_buckets(&self, buckets: Vec<String>) -> DbResult<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        info!(buckets = ?buckets, "Resetting buckets");

        self.pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    for bucket in &buckets {
                        sqlx::query("DELETE FROM ps_oplog WHERE bucket = ?1")
                            .bind(bucket)
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query("DELETE FROM ps_staging WHERE bucket = ?1")
                            .bind(bucket)
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query(
                            r#"
                            INSERT INTO ps_buckets (name) VALUES (?1)
                            ON CONFLICT (name) DO UPDATE SET last_op = 0, add_checksum = 0
                            "#,
                        )
                        .bind(bucket)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Deletes buckets that are no longer part of the checkpoint. Their rows
    /// are re-evaluated on the next apply.
    pub async fn remove_buckets(&self, buckets: Vec<String>) -> DbResult<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        info!(buckets = ?buckets, "Removing buckets");

        self.pool
            .write_transaction(move |conn| {
                Box::pin(async move {
                    for bucket in &buckets {
                        sqlx::query(
                            r#"
                            INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id)
                            SELECT row_type, row_id FROM ps_oplog
                            WHERE bucket = ?1 AND row_type IS NOT NULL AND row_id IS NOT NULL
                            "#,
                        )
                        .bind(bucket)
                        .execute(&mut *conn)
                        .await?;
                        for table in ["ps_oplog", "ps_staging"] {
                            sqlx::query(&format!("DELETE FROM {table} WHERE bucket = ?1"))
                                .bind(bucket)
                                .execute(&mut *conn)
                                .await?;
                        }
                        sqlx::query("DELETE FROM ps_buckets WHERE name = ?1")
                            .bind(bucket)
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Buckets currently known locally, excluding `$local`.
    pub async fn bucket_names(&self) -> DbResult<Vec<String>> {
        Ok(self
            .bucket_states()
            .await?
            .into_iter()
            .map(|s| s.bucket)
            .collect())
    }

    /// True once any full checkpoint has been applied.
    pub async fn has_completed_sync(&self) -> DbResult<bool> {
        Ok(self.last_synced_at().await?.is_some())
    }

    /// Time of the last full apply.
    pub async fn last_synced_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.pool
            .read(|conn| {
                Box::pin(async move {
                    let value: Option<String> =
                        sqlx::query_scalar("SELECT value FROM ps_kv WHERE key = ?1")
                            .bind(LAST_SYNCED_AT)
                            .fetch_optional(&mut *conn)
                            .await?
                            .flatten();
                    Ok(value
                        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                        .map(|t| t.with_timezone(&Utc)))
                })
            })
            .await
    }

    /// Whether synced data may currently overwrite local rows.
    pub async fn local_target_reached(&self) -> DbResult<bool> {
        self.pool
            .read(|conn| Box::pin(async move { can_materialize(conn).await }))
            .await
    }
}

// =============================================================================
// Apply helpers (all run inside the apply transaction)
// =============================================================================

struct StagedOp {
    op_id: i64,
    op: OpType,
    row_type: Option<String>,
    row_id: Option<String>,
    subkey: Option<String>,
    data: Option<String>,
    checksum: i64,
}

type RowKey = (String, String);

async fn apply_in_transaction(
    conn: &mut SqliteConnection,
    checkpoint: &Checkpoint,
    priority: Option<BucketPriority>,
) -> DbResult<ApplyOutcome> {
    let in_scope = match priority {
        Some(p) => checkpoint.buckets_up_to(p),
        None => checkpoint.checksums.iter().collect(),
    };

    let mut affected = BTreeSet::new();
    let mut applied = 0;
    for bucket in &in_scope {
        ensure_bucket(conn, &bucket.bucket).await?;
        applied += drain_staging(conn, &bucket.bucket, &mut affected).await?;
    }

    let mut failed_buckets = Vec::new();
    for bucket in &in_scope {
        let local = local_checksum(conn, &bucket.bucket).await?;
        if local != bucket.checksum {
            debug!(
                bucket = %bucket.bucket,
                expected = %bucket.checksum,
                actual = %local,
                "Bucket checksum differs"
            );
            failed_buckets.push(bucket.bucket.clone());
        }
    }
    if !failed_buckets.is_empty() {
        return Err(DbError::ChecksumMismatch { failed_buckets });
    }

    for bucket in &in_scope {
        sqlx::query("UPDATE ps_buckets SET last_op = MAX(last_op, ?1) WHERE name = ?2")
            .bind(checkpoint.last_op_id.value())
            .bind(&bucket.bucket)
            .execute(&mut *conn)
            .await?;
    }

    let full = priority.is_none();
    if full {
        if let Some(write_checkpoint) = &checkpoint.write_checkpoint {
            let op: OpId = write_checkpoint.parse()?;
            sqlx::query("UPDATE ps_buckets SET last_op = MAX(last_op, ?1) WHERE name = ?2")
                .bind(op.value())
                .bind(LOCAL_BUCKET)
                .execute(&mut *conn)
                .await?;
        }
    }

    let ready = can_materialize(conn).await?;
    let touched_tables = if ready {
        let tables = materialize(conn, affected).await?;
        if full {
            sqlx::query("INSERT OR REPLACE INTO ps_kv (key, value) VALUES (?1, ?2)")
                .bind(LAST_SYNCED_AT)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *conn)
                .await?;
        }
        tables
    } else {
        debug!(rows = affected.len(), "Local writes pending, deferring rows");
        for (row_type, row_id) in &affected {
            sqlx::query("INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id) VALUES (?1, ?2)")
                .bind(row_type)
                .bind(row_id)
                .execute(&mut *conn)
                .await?;
        }
        Vec::new()
    };

    Ok(ApplyOutcome {
        applied,
        ready,
        touched_tables,
    })
}

async fn ensure_bucket(conn: &mut SqliteConnection, bucket: &str) -> DbResult<()> {
    sqlx::query("INSERT OR IGNORE INTO ps_buckets (name) VALUES (?1)")
        .bind(bucket)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn add_to_checksum(conn: &mut SqliteConnection, bucket: &str, amount: i64) -> DbResult<()> {
    if amount == 0 {
        return Ok(());
    }
    let current: i64 = sqlx::query_scalar("SELECT add_checksum FROM ps_buckets WHERE name = ?1")
        .bind(bucket)
        .fetch_one(&mut *conn)
        .await?;
    let sum = Checksum::from_i64(current) + Checksum::from_i64(amount);
    sqlx::query("UPDATE ps_buckets SET add_checksum = ?1 WHERE name = ?2")
        .bind(sum.as_i64())
        .bind(bucket)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Moves every staged op of `bucket` into the oplog. Returns the op count.
async fn drain_staging(
    conn: &mut SqliteConnection,
    bucket: &str,
    affected: &mut BTreeSet<RowKey>,
) -> DbResult<usize> {
    let rows = sqlx::query(
        r#"
        SELECT op_id, op, row_type, row_id, subkey, data, checksum
        FROM ps_staging WHERE bucket = ?1 ORDER BY op_id
        "#,
    )
    .bind(bucket)
    .fetch_all(&mut *conn)
    .await?;

    let mut staged = Vec::with_capacity(rows.len());
    for row in &rows {
        staged.push(StagedOp {
            op_id: row.get("op_id"),
            op: row.get::<String, _>("op").parse()?,
            row_type: row.get("row_type"),
            row_id: row.get("row_id"),
            subkey: row.get("subkey"),
            data: row.get("data"),
            checksum: row.get("checksum"),
        });
    }

    for op in &staged {
        match op.op {
            OpType::Put | OpType::Remove => apply_row_op(conn, bucket, op, affected).await?,
            OpType::Move => add_to_checksum(conn, bucket, op.checksum).await?,
            OpType::Clear => {
                let rows = sqlx::query(
                    r#"
                    SELECT DISTINCT row_type, row_id FROM ps_oplog
                    WHERE bucket = ?1 AND row_type IS NOT NULL AND row_id IS NOT NULL
                    "#,
                )
                .bind(bucket)
                .fetch_all(&mut *conn)
                .await?;
                affected.extend(rows.iter().map(|r| (r.get::<String, _>(0), r.get::<String, _>(1))));

                sqlx::query("DELETE FROM ps_oplog WHERE bucket = ?1")
                    .bind(bucket)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("UPDATE ps_buckets SET add_checksum = ?1 WHERE name = ?2")
                    .bind(op.checksum)
                    .bind(bucket)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }

    sqlx::query("DELETE FROM ps_staging WHERE bucket = ?1")
        .bind(bucket)
        .execute(&mut *conn)
        .await?;
    Ok(staged.len())
}

async fn apply_row_op(
    conn: &mut SqliteConnection,
    bucket: &str,
    op: &StagedOp,
    affected: &mut BTreeSet<RowKey>,
) -> DbResult<()> {
    if let (Some(row_type), Some(row_id)) = (&op.row_type, &op.row_id) {
        affected.insert((row_type.clone(), row_id.clone()));
    }

    // An op arriving after a newer one for the same row is already superseded.
    let newer: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT op_id FROM ps_oplog
        WHERE bucket = ?1 AND row_type IS ?2 AND row_id IS ?3 AND subkey IS ?4 AND op_id > ?5
        LIMIT 1
        "#,
    )
    .bind(bucket)
    .bind(&op.row_type)
    .bind(&op.row_id)
    .bind(&op.subkey)
    .bind(op.op_id)
    .fetch_optional(&mut *conn)
    .await?;
    if newer.is_some() {
        return add_to_checksum(conn, bucket, op.checksum).await;
    }

    let superseded = sqlx::query(
        r#"
        SELECT op_id, checksum FROM ps_oplog
        WHERE bucket = ?1 AND row_type IS ?2 AND row_id IS ?3 AND subkey IS ?4 AND op_id < ?5
        "#,
    )
    .bind(bucket)
    .bind(&op.row_type)
    .bind(&op.row_id)
    .bind(&op.subkey)
    .bind(op.op_id)
    .fetch_all(&mut *conn)
    .await?;

    let folded: Checksum = superseded
        .iter()
        .map(|r| Checksum::from_i64(r.get("checksum")))
        .sum();
    for row in &superseded {
        sqlx::query("DELETE FROM ps_oplog WHERE bucket = ?1 AND op_id = ?2")
            .bind(bucket)
            .bind(row.get::<i64, _>("op_id"))
            .execute(&mut *conn)
            .await?;
    }
    add_to_checksum(conn, bucket, folded.as_i64()).await?;

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO ps_oplog
            (bucket, op_id, op, row_type, row_id, subkey, data, checksum)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(bucket)
    .bind(op.op_id)
    .bind(op.op.as_str())
    .bind(&op.row_type)
    .bind(&op.row_id)
    .bind(&op.subkey)
    .bind(&op.data)
    .bind(op.checksum)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn local_checksum(conn: &mut SqliteConnection, bucket: &str) -> DbResult<Checksum> {
    let add: i64 = sqlx::query_scalar("SELECT add_checksum FROM ps_buckets WHERE name = ?1")
        .bind(bucket)
        .fetch_one(&mut *conn)
        .await?;
    let ops: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(checksum), 0) FROM ps_oplog WHERE bucket = ?1")
            .bind(bucket)
            .fetch_one(&mut *conn)
            .await?;
    Ok(Checksum::from_i64(add) + Checksum::from_i64(ops))
}

/// `$local` has reached its target and nothing waits for upload.
pub(crate) async fn can_materialize(conn: &mut SqliteConnection) -> DbResult<bool> {
    let blocked: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (SELECT 1 FROM ps_buckets WHERE name = ?1 AND target_op > last_op)
            OR EXISTS (SELECT 1 FROM ps_crud)
        "#,
    )
    .bind(LOCAL_BUCKET)
    .fetch_one(&mut *conn)
    .await?;
    Ok(!blocked)
}

/// Writes the current value of `rows`, plus every deferred row, into the
/// storage tables. Returns the application tables that changed.
async fn materialize(
    conn: &mut SqliteConnection,
    mut rows: BTreeSet<RowKey>,
) -> DbResult<Vec<String>> {
    let deferred = sqlx::query("SELECT row_type, row_id FROM ps_updated_rows")
        .fetch_all(&mut *conn)
        .await?;
    rows.extend(
        deferred
            .iter()
            .map(|r| (r.get::<String, _>(0), r.get::<String, _>(1))),
    );
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let storage: HashSet<String> = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB 'ps_data__*'",
    )
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect();

    let mut touched = BTreeSet::new();
    for (row_type, row_id) in &rows {
        let current: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT data FROM ps_oplog
            WHERE row_type = ?1 AND row_id = ?2 AND op = 'PUT'
            ORDER BY op_id DESC LIMIT 1
            "#,
        )
        .bind(row_type)
        .bind(row_id)
        .fetch_optional(&mut *conn)
        .await?;

        let table = format!("{DATA_PREFIX}{row_type}");
        if storage.contains(&table) {
            let table = quote_ident(&table);
            match current {
                Some(data) => {
                    sqlx::query(&format!(
                        "INSERT OR REPLACE INTO {table} (id, data) VALUES (?1, ?2)"
                    ))
                    .bind(row_id)
                    .bind(data)
                    .execute(&mut *conn)
                    .await?;
                }
                None => {
                    sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
                        .bind(row_id)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            touched.insert(row_type.clone());
        } else {
            match current {
                Some(data) => {
                    sqlx::query("INSERT OR REPLACE INTO ps_untyped (type, id, data) VALUES (?1, ?2, ?3)")
                        .bind(row_type)
                        .bind(row_id)
                        .bind(data)
                        .execute(&mut *conn)
                        .await?;
                }
                None => {
                    sqlx::query("DELETE FROM ps_untyped WHERE type = ?1 AND id = ?2")
                        .bind(row_type)
                        .bind(row_id)
                        .execute(&mut *conn)
                        .await?;
                }
            }
        }
    }

    sqlx::query("DELETE FROM ps_updated_rows WHERE 1")
        .execute(&mut *conn)
        .await?;
    debug!(rows = rows.len(), tables = touched.len(), "Rows materialized");
    Ok(touched.into_iter().collect())
}
