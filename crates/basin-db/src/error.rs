//! # Database Error Types
//!
//! Error types for storage operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds categorization                           │
//! │       │                                                                 │
//! │       ├── is_corruption() ──► pool moves to the broken state            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Storage (basin-sync) or the application                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use basin_core::CoreError;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool was closed, or broke after a corruption error.
    #[error("Connection closed")]
    Closed,

    /// SQLite reported a corrupt or non-database file.
    ///
    /// ## When This Occurs
    /// - `SQLITE_CORRUPT` (11) or `SQLITE_NOTADB` (26), including extended codes
    /// - The pool closes itself after returning this
    #[error("Database corrupted: {0}")]
    Corrupt(String),

    /// Opening a connection failed.
    ///
    /// ## When This Occurs
    /// - Parent directory doesn't exist
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Statement execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Duplicate {field}")]
    UniqueViolation { field: String },

    /// Locally recomputed checksums disagree with the checkpoint.
    ///
    /// The apply transaction has already been rolled back when this is returned.
    #[error("Checksum mismatch for buckets {failed_buckets:?}")]
    ChecksumMismatch { failed_buckets: Vec<String> },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// True when the database file itself is unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, DbError::Corrupt(_))
    }
}

const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTADB: i64 = 26;

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Corrupt / UniqueViolation / QueryFailed
/// sqlx::Error::PoolClosed     → DbError::Closed
/// sqlx::Error::Io             → DbError::ConnectionFailed
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message().to_string();
                // Extended result codes carry the primary code in the low byte.
                let primary = db_err
                    .code()
                    .and_then(|c| c.parse::<i64>().ok())
                    .map(|c| c & 0xff);

                match primary {
                    Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB) => DbError::Corrupt(msg),
                    _ if msg.contains("UNIQUE constraint failed") => DbError::UniqueViolation {
                        field: msg
                            .split("UNIQUE constraint failed: ")
                            .nth(1)
                            .unwrap_or("unknown")
                            .to_string(),
                    },
                    _ => DbError::QueryFailed(msg),
                }
            }

            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => DbError::Closed,

            sqlx::Error::Io(e) => DbError::ConnectionFailed(e.to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for storage operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_corrupt_counts_as_corruption() {
        assert!(DbError::Corrupt("bad page".into()).is_corruption());
        assert!(!DbError::Closed.is_corruption());
        assert!(!DbError::QueryFailed("syntax".into()).is_corruption());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
