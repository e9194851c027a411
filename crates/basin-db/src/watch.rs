//! # Watched Queries
//!
//! Live result sets that re-run when their tables change.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  pool.update_notifications()   subscribed before the first query        │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  filter: notification ∩ dependency tables ≠ ∅   (lagged = changed)      │
//! │        │                                                                │
//! │  prepend one "initial" trigger                                          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  throttled(T)      leading edge, newest wins, non-additive window       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  run query on a read lease ──► WatchedQuery (Stream)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping a [`WatchedQuery`] drops its notification receiver and any
//! in-flight query, including the lease it holds.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use sqlx::sqlite::SqliteRow;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

use crate::error::DbResult;
use crate::params::{bind_params, SqlParam};
use crate::pool::{ConnectionPool, TableUpdates};
use crate::schema::public_table_name;
use crate::throttle::throttled;

/// Default minimum interval between two results of one watched query.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(30);

/// A live query. Yields the current result first, then a fresh result after
/// each relevant change.
pub struct WatchedQuery<T> {
    inner: BoxStream<'static, DbResult<T>>,
}

impl<T> Stream for WatchedQuery<T> {
    type Item = DbResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// True if `updates` touches any table in `watched`, by public or storage name.
pub fn is_relevant(updates: &TableUpdates, watched: &HashSet<String>) -> bool {
    updates
        .iter()
        .any(|table| watched.contains(table) || watched.contains(public_table_name(table)))
}

/// Stream of `()` for every notification relevant to `watched`.
fn change_triggers(
    rx: broadcast::Receiver<TableUpdates>,
    watched: HashSet<String>,
) -> impl Stream<Item = ()> + Send + 'static {
    stream::unfold((rx, watched), |(mut rx, watched)| async move {
        loop {
            match rx.recv().await {
                Ok(updates) if is_relevant(&updates, &watched) => {
                    trace!(tables = ?updates, "Watched tables changed");
                    return Some(((), (rx, watched)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Watch subscriber lagged, re-running query");
                    return Some(((), (rx, watched)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// Watches a query built by `run`. Used by every `Database::watch*` variant.
pub fn watch_with<T, F>(
    pool: Arc<ConnectionPool>,
    tables: impl IntoIterator<Item = impl Into<String>>,
    throttle: Duration,
    run: F,
) -> WatchedQuery<T>
where
    T: Send + 'static,
    F: Fn(Arc<ConnectionPool>) -> futures_util::future::BoxFuture<'static, DbResult<T>>
        + Send
        + Sync
        + 'static,
{
    let watched: HashSet<String> = tables.into_iter().map(Into::into).collect();
    // Subscribe now so nothing committed after this call is missed.
    let rx = pool.update_notifications();

    let triggers = stream::once(async {}).chain(change_triggers(rx, watched));
    let inner = throttled(triggers, throttle)
        .then(move |()| run(pool.clone()))
        .boxed();

    WatchedQuery { inner }
}

/// Watches `sql`, yielding raw rows.
pub fn watch_rows(
    pool: Arc<ConnectionPool>,
    sql: impl Into<String>,
    params: Vec<SqlParam>,
    tables: Vec<String>,
    throttle: Duration,
) -> WatchedQuery<Vec<SqliteRow>> {
    let sql = sql.into();
    watch_with(pool, tables, throttle, move |pool| {
        Box::pin(fetch_rows(pool, sql.clone(), params.clone()))
    })
}

async fn fetch_rows(
    pool: Arc<ConnectionPool>,
    sql: String,
    params: Vec<SqlParam>,
) -> DbResult<Vec<SqliteRow>> {
    pool.read(move |conn| {
        Box::pin(async move {
            Ok(bind_params(sqlx::query(&sql), &params)
                .fetch_all(&mut *conn)
                .await?)
        })
    })
    .await
}

/// Watches `sql`, mapping every row with `mapper`.
pub fn watch_map<R, M>(
    pool: Arc<ConnectionPool>,
    sql: impl Into<String>,
    params: Vec<SqlParam>,
    tables: Vec<String>,
    throttle: Duration,
    mapper: M,
) -> WatchedQuery<Vec<R>>
where
    R: Send + 'static,
    M: Fn(&SqliteRow) -> DbResult<R> + Send + Sync + 'static,
{
    let mapper = Arc::new(mapper);
    let rows = watch_rows(pool, sql, params, tables, throttle);
    WatchedQuery {
        inner: rows
            .map(move |result| result.and_then(|rows| rows.iter().map(|r| mapper(r)).collect()))
            .boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::schema::{apply_schema, Column, Schema, Table};
    use sqlx::Row;
    use tokio::time::timeout;

    async fn pool_with_users() -> Arc<ConnectionPool> {
        let pool = Arc::new(ConnectionPool::lazy(PoolConfig::in_memory()));
        pool.write_transaction(|conn| {
            Box::pin(async move {
                let schema = Schema::new(vec![
                    Table::new("users", vec![Column::text("name")]),
                    Table::new("pets", vec![Column::text("name")]),
                ]);
                apply_schema(conn, &schema).await
            })
        })
        .await
        .unwrap();
        pool
    }

    async fn exec(pool: &ConnectionPool, sql: &'static str) {
        pool.write(move |conn| {
            Box::pin(async move {
                sqlx::query(sql).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    }

    fn count_users(pool: Arc<ConnectionPool>) -> WatchedQuery<Vec<i64>> {
        watch_map(
            pool,
            "SELECT COUNT(*) FROM users",
            vec![],
            vec!["users".to_string()],
            Duration::from_millis(10),
            |row| Ok(row.get::<i64, _>(0)),
        )
    }

    #[tokio::test]
    async fn first_result_is_immediate_and_changes_follow() {
        let pool = pool_with_users().await;
        let mut watch = count_users(pool.clone());

        assert_eq!(watch.next().await.unwrap().unwrap(), vec![0]);

        exec(&pool, "INSERT INTO users (id, name) VALUES ('u1', 'ada')").await;
        let next = timeout(Duration::from_secs(2), watch.next()).await.unwrap();
        assert_eq!(next.unwrap().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn unrelated_tables_do_not_trigger() {
        let pool = pool_with_users().await;
        let mut watch = count_users(pool.clone());
        watch.next().await.unwrap().unwrap();

        exec(&pool, "INSERT INTO pets (id, name) VALUES ('p1', 'rex')").await;
        assert!(timeout(Duration::from_millis(200), watch.next()).await.is_err());
    }

    #[tokio::test]
    async fn rapid_changes_coalesce_into_the_latest_state() {
        let pool = pool_with_users().await;
        let mut watch = watch_map(
            pool.clone(),
            "SELECT COUNT(*) FROM users",
            vec![],
            vec!["users".to_string()],
            Duration::from_millis(200),
            |row| Ok(row.get::<i64, _>(0)),
        );
        watch.next().await.unwrap().unwrap();

        for sql in [
            "INSERT INTO users (id, name) VALUES ('a', 'a')",
            "INSERT INTO users (id, name) VALUES ('b', 'b')",
            "INSERT INTO users (id, name) VALUES ('c', 'c')",
        ] {
            exec(&pool, sql).await;
        }

        let mut results = Vec::new();
        loop {
            let value = timeout(Duration::from_secs(2), watch.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            results.push(value[0]);
            if value[0] == 3 {
                break;
            }
        }
        assert!(results.len() <= 2, "expected coalescing, got {results:?}");
    }

    #[tokio::test]
    async fn dropping_the_watch_releases_the_subscription() {
        let pool = pool_with_users().await;
        let mut watch = count_users(pool.clone());
        watch.next().await.unwrap().unwrap();
        assert_eq!(pool.subscriber_count(), 1);

        drop(watch);
        assert_eq!(pool.subscriber_count(), 0);
    }

    #[test]
    fn storage_names_match_public_dependencies() {
        let watched: HashSet<String> = ["users".to_string()].into_iter().collect();
        let updates: TableUpdates = Arc::new(["ps_data__users".to_string()].into_iter().collect());
        assert!(is_relevant(&updates, &watched));

        let other: TableUpdates = Arc::new(["ps_crud".to_string()].into_iter().collect());
        assert!(!is_relevant(&other, &watched));
    }
}
