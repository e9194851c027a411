//! # Connection Pool
//!
//! One writer, N readers, and a broadcast of the tables each write touched.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ConnectionPool                                  │
//! │                                                                         │
//! │  write(f) ──► Mutex<writer> ──► f(&mut conn) ──► publish committed     │
//! │                   │                                  tables             │
//! │                   │ update hook:   table → pending                      │
//! │                   │ commit hook:   pending → committed                  │
//! │                   │ rollback hook: pending cleared                      │
//! │                   │ rows changed without a hook call: every table       │
//! │                                                                         │
//! │  read(f)  ──► SqlitePool (read-only, N conns) ──► f(&mut conn)          │
//! │               (in-memory: shares the writer mutex)                      │
//! │                                                                         │
//! │  updates  ──► broadcast::Sender<TableUpdates> ──► watchers, uploader    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lazy Open
//! Nothing touches the file system until the first lease is requested. A
//! failed open is returned to that caller and attempted again on the next
//! call.
//!
//! ## Unhooked Changes
//! SQLite skips the update hook for an unfiltered `DELETE` (truncate
//! optimization) and for `WITHOUT ROWID` tables. The writer compares
//! `total_changes()` with the rows the hook saw; on a shortfall every table
//! is published.
//!
//! ## Callbacks
//! Lease callbacks have the shape
//! `|conn| Box::pin(async move { ... })` and must own everything they
//! capture.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Connection, Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::{broadcast, Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{DbError, DbResult};
use crate::migrations;

/// Names of the tables changed by one committed write.
pub type TableUpdates = Arc<HashSet<String>>;

const NOTIFICATION_CAPACITY: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Pool configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = PoolConfig::new("/path/to/app.db").read_connections(2);
/// let pool = ConnectionPool::lazy(config);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub path: PathBuf,
    /// Read-only connections next to the writer. Ignored in memory.
    pub read_connections: u32,
    pub busy_timeout: Duration,
    pub in_memory: bool,
}

impl PoolConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PoolConfig {
            path: path.into(),
            read_connections: 4,
            busy_timeout: Duration::from_secs(30),
            in_memory: false,
        }
    }

    /// Single-connection in-memory database (for testing).
    pub fn in_memory() -> Self {
        PoolConfig {
            path: PathBuf::from(":memory:"),
            read_connections: 0,
            busy_timeout: Duration::from_secs(5),
            in_memory: true,
        }
    }

    pub fn read_connections(mut self, count: u32) -> Self {
        self.read_connections = count;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn single_connection(&self) -> bool {
        self.in_memory || self.read_connections == 0
    }
}

// =============================================================================
// Change tracking
// =============================================================================

#[derive(Debug, Default)]
struct ChangeTracker {
    pending: HashSet<String>,
    committed: HashSet<String>,
    /// Rows reported by the update hook since the writer opened.
    hooked_rows: i64,
}

#[derive(Debug, Clone, Default)]
struct SharedTracker(Arc<StdMutex<ChangeTracker>>);

impl SharedTracker {
    fn lock(&self) -> StdMutexGuard<'_, ChangeTracker> {
        // Hooks never panic while holding the lock; recover the data if one did.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_committed(&self) -> HashSet<String> {
        std::mem::take(&mut self.lock().committed)
    }

    fn hooked_rows(&self) -> i64 {
        self.lock().hooked_rows
    }
}

async fn total_changes(conn: &mut SqliteConnection) -> DbResult<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT total_changes()")
        .fetch_one(&mut *conn)
        .await?)
}

/// Counters taken before a write lease runs.
#[derive(Debug, Clone, Copy)]
struct ChangeMark {
    changes: i64,
    hooked: i64,
}

impl ChangeMark {
    async fn take(conn: &mut SqliteConnection, tracker: &SharedTracker) -> DbResult<Self> {
        Ok(ChangeMark {
            changes: total_changes(conn).await?,
            hooked: tracker.hooked_rows(),
        })
    }

    /// Marks every table as committed if rows changed behind the update hook.
    async fn settle(self, conn: &mut SqliteConnection, tracker: &SharedTracker) {
        let changes = match total_changes(conn).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "Could not read change counter");
                return;
            }
        };
        let unhooked = (changes - self.changes) - (tracker.hooked_rows() - self.hooked);
        if unhooked <= 0 {
            return;
        }

        let tables: Vec<String> =
            match sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&mut *conn)
                .await
            {
                Ok(tables) => tables,
                Err(e) => {
                    warn!(error = %e, "Could not list tables");
                    return;
                }
            };
        debug!(unhooked, "Rows changed without update hook, publishing every table");
        tracker.lock().committed.extend(tables);
    }
}

async fn install_hooks(conn: &mut SqliteConnection, tracker: &SharedTracker) -> DbResult<()> {
    let mut handle = conn.lock_handle().await?;

    let on_update = tracker.clone();
    handle.set_update_hook(move |change| {
        let mut state = on_update.lock();
        state.hooked_rows += 1;
        state.pending.insert(change.table.to_string());
    });

    let on_commit = tracker.clone();
    handle.set_commit_hook(move || {
        let mut state = on_commit.lock();
        let pending = std::mem::take(&mut state.pending);
        state.committed.extend(pending);
        true
    });

    let on_rollback = tracker.clone();
    handle.set_rollback_hook(move || {
        on_rollback.lock().pending.clear();
    });

    Ok(())
}

// =============================================================================
// Pool
// =============================================================================

struct Opened {
    /// `None` once closed.
    writer: Mutex<Option<SqliteConnection>>,
    readers: Option<SqlitePool>,
    tracker: SharedTracker,
}

/// All connections at once, for schema-style operations.
pub struct AllConnections<'c> {
    pub writer: &'c mut SqliteConnection,
    pub readers: &'c mut [PoolConnection<Sqlite>],
}

/// Single-writer / multi-reader access to the embedded database.
pub struct ConnectionPool {
    config: PoolConfig,
    inner: OnceCell<Opened>,
    updates: broadcast::Sender<TableUpdates>,
    closed: AtomicBool,
    /// Shared with other pools on the same storage.
    shared_write_lock: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.config.path)
            .field("opened", &self.inner.initialized())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool without opening anything.
    pub fn lazy(config: PoolConfig) -> Self {
        let (updates, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        ConnectionPool {
            config,
            inner: OnceCell::new(),
            updates,
            closed: AtomicBool::new(false),
            shared_write_lock: None,
        }
    }

    /// Serializes this pool's write leases with every pool holding `lock`.
    pub fn with_shared_write_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.shared_write_lock = Some(lock);
        self
    }

    async fn lock_shared_writes(&self) -> Option<OwnedMutexGuard<()>> {
        match &self.shared_write_lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// New subscription to committed table changes.
    ///
    /// Only changes committed after this call are delivered.
    pub fn update_notifications(&self) -> broadcast::Receiver<TableUpdates> {
        self.updates.subscribe()
    }

    /// Live notification receivers.
    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn opened(&self) -> DbResult<&Opened> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        self.inner.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> DbResult<Opened> {
        let config = &self.config;
        info!(
            path = %config.path.display(),
            in_memory = config.in_memory,
            "Opening database"
        );

        let base = if config.in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };
        let options = base.foreign_keys(true).busy_timeout(config.busy_timeout);

        let mut writer = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        migrations::run_migrations(&mut writer).await?;

        // Hooks go in after migrations so bookkeeping never reaches subscribers.
        let tracker = SharedTracker::default();
        install_hooks(&mut writer, &tracker).await?;

        let readers = if config.single_connection() {
            None
        } else {
            let read_options = SqliteConnectOptions::new()
                .filename(&config.path)
                .read_only(true)
                .busy_timeout(config.busy_timeout);
            Some(
                SqlitePoolOptions::new()
                    .max_connections(config.read_connections)
                    .min_connections(0)
                    .connect_lazy_with(read_options),
            )
        };

        debug!(readers = config.read_connections, "Database opened");

        Ok(Opened {
            writer: Mutex::new(Some(writer)),
            readers,
            tracker,
        })
    }

    /// Runs `f` with the write lease.
    ///
    /// Tables whose changes were committed while `f` ran are published after
    /// the lease is released.
    pub async fn write<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>> + Send,
        T: Send,
    {
        let _shared = self.lock_shared_writes().await;
        let opened = self.opened().await?;
        let result = {
            let mut guard = opened.writer.lock().await;
            let conn = guard.as_mut().ok_or(DbError::Closed)?;
            let mark = ChangeMark::take(conn, &opened.tracker).await?;
            let result = f(&mut *conn).await;
            mark.settle(conn, &opened.tracker).await;
            result
        };

        self.publish(opened);
        self.after_error(&result).await;
        result
    }

    /// Runs `f` inside `BEGIN`/`COMMIT` on the writer. Errors roll back.
    pub async fn write_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.write(move |conn| Box::pin(in_transaction(conn, f))).await
    }

    /// Runs `f` with a read lease.
    pub async fn read<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>> + Send,
        T: Send,
    {
        let opened = self.opened().await?;

        let result = match &opened.readers {
            Some(readers) => {
                let mut conn = readers.acquire().await?;
                f(&mut *conn).await
            }
            None => {
                let mut guard = opened.writer.lock().await;
                let conn = guard.as_mut().ok_or(DbError::Closed)?;
                f(conn).await
            }
        };

        self.after_error(&result).await;
        result
    }

    /// Runs `f` with a read lease inside a deferred transaction.
    pub async fn read_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.read(move |conn| Box::pin(in_transaction(conn, f))).await
    }

    /// Takes the writer and every reader, then runs `f` with all of them.
    ///
    /// No other lease can be held while `f` runs.
    pub async fn with_all_connections<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(AllConnections<'c>) -> BoxFuture<'c, DbResult<T>> + Send,
        T: Send,
    {
        let _shared = self.lock_shared_writes().await;
        let opened = self.opened().await?;
        let result = {
            let mut guard = opened.writer.lock().await;
            let writer = guard.as_mut().ok_or(DbError::Closed)?;

            let mut readers = Vec::new();
            if let Some(pool) = &opened.readers {
                for _ in 0..self.config.read_connections {
                    readers.push(pool.acquire().await?);
                }
            }

            f(AllConnections {
                writer,
                readers: &mut readers,
            })
            .await
        };

        self.publish(opened);
        self.after_error(&result).await;
        result
    }

    /// Releases every connection. Idempotent.
    ///
    /// Waits for the current write lease; in-flight reads finish on their
    /// own connections.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release().await;
        info!(path = %self.config.path.display(), "Database closed");
    }

    async fn release(&self) {
        let Some(opened) = self.inner.get() else {
            return;
        };

        let writer = opened.writer.lock().await.take();
        if let Some(writer) = writer {
            if let Err(e) = writer.close().await {
                warn!(error = %e, "Error while closing writer");
            }
        }
        if let Some(readers) = &opened.readers {
            readers.close().await;
        }
    }

    fn publish(&self, opened: &Opened) {
        let changed = opened.tracker.take_committed();
        if changed.is_empty() {
            return;
        }
        debug!(tables = ?changed, "Publishing table updates");
        // No receivers: dropped on purpose.
        let _ = self.updates.send(Arc::new(changed));
    }

    async fn after_error<T>(&self, result: &DbResult<T>) {
        if let Err(e) = result {
            if e.is_corruption() && !self.closed.swap(true, Ordering::SeqCst) {
                error!(error = %e, path = %self.config.path.display(), "Database corrupted, closing pool");
                self.release().await;
            }
        }
    }
}

async fn in_transaction<T, F>(conn: &mut SqliteConnection, f: F) -> DbResult<T>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>>,
{
    let mut tx = conn.begin().await?;
    match f(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
