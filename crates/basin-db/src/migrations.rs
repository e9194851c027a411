//! # Database Migrations
//!
//! Embedded SQL migrations for the internal `ps_*` tables.
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Name format: `NNNN_description.sql`
//! 3. Use `IF NOT EXISTS` so a half-applied file can be re-run
//! 4. **NEVER** modify existing migrations - always add new ones
//!
//! Application tables are not migrated here. They are views over JSON
//! storage tables, recreated by [`crate::schema`] whenever the schema changes.

use sqlx::SqliteConnection;
use tracing::info;

use crate::error::DbResult;

/// Embedded migrations from the workspace `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending migrations on the writer connection.
///
/// Idempotent: already-applied migrations are skipped.
pub async fn run_migrations(conn: &mut SqliteConnection) -> DbResult<()> {
    info!(
        count = MIGRATOR.iter().count(),
        "Running embedded migrations"
    );

    // `run_direct` is what `run` calls after `acquire()`; calling it directly
    // avoids the "`Acquire` is not general enough" error in `Send` futures.
    MIGRATOR.run_direct(conn).await?;

    info!("Migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    #[tokio::test]
    async fn migrations_create_internal_tables_and_rerun_cleanly() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        run_migrations(&mut conn).await.unwrap();
        run_migrations(&mut conn).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ps\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(&mut conn)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in ["ps_buckets", "ps_crud", "ps_kv", "ps_oplog", "ps_staging", "ps_tx"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }
}
