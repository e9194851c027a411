//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Config         │  │  Network        │  │  Protocol               │ │
//! │  │                 │  │  Unauthorized   │  │  ChecksumMismatch       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Credentials   │  │     Upload      │  │      Storage            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Credential     │  │  Upload         │  │  Storage                │ │
//! │  │  NotSignedIn    │  │                 │  │  Shutdown               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Recovery
//! | Error              | What happens                                      |
//! |--------------------|---------------------------------------------------|
//! | `Network`          | reconnect with backoff                            |
//! | `Protocol`         | drop the connection, reconnect with backoff       |
//! | `ChecksumMismatch` | reset the failed buckets, reconnect at once       |
//! | `Unauthorized`     | invalidate credentials, reconnect with backoff    |
//! | `Upload`           | retry the same transaction after a fixed delay    |
//! | `Storage`          | surfaced to the caller                            |

use thiserror::Error;

use basin_core::CoreError;
use basin_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    Config(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Request failed, timed out or the stream broke off.
    #[error("Network error: {0}")]
    Network(String),

    /// The service rejected the token (HTTP 401).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed stream line. Fatal to the current connection only.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Checksum mismatch for buckets {failed_buckets:?}")]
    ChecksumMismatch { failed_buckets: Vec<String> },

    // =========================================================================
    // Credential Errors
    // =========================================================================
    #[error("Failed to fetch credentials: {0}")]
    Credential(String),

    /// The connector has no credentials for the current user.
    #[error("Not signed in")]
    NotSignedIn,

    // =========================================================================
    // Upload Errors
    // =========================================================================
    #[error("Upload failed: {0}")]
    Upload(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(DbError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Sync client is shutting down")]
    Shutdown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ChecksumMismatch { failed_buckets } => {
                SyncError::ChecksumMismatch { failed_buckets }
            }
            other => SyncError::Storage(other),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            return SyncError::Unauthorized(err.to_string());
        }
        if err.is_decode() {
            return SyncError::Protocol(err.to_string());
        }
        SyncError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::Config(format!("invalid endpoint: {err}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if reconnecting (or re-uploading) can fix this.
    ///
    /// Storage errors are retryable unless they report a damaged database.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_)
            | SyncError::Unauthorized(_)
            | SyncError::Protocol(_)
            | SyncError::ChecksumMismatch { .. }
            | SyncError::Credential(_)
            | SyncError::Upload(_) => true,
            SyncError::Storage(e) => !e.is_corruption() && !matches!(e, DbError::Closed),
            SyncError::Config(_) | SyncError::NotSignedIn | SyncError::Shutdown => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, SyncError::Config(_))
    }

    /// Returns true if the cached credentials should be dropped.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Upload("500".into()).is_retryable());
        assert!(SyncError::Storage(DbError::QueryFailed("busy".into())).is_retryable());

        assert!(!SyncError::Config("bad".into()).is_retryable());
        assert!(!SyncError::Storage(DbError::Closed).is_retryable());
        assert!(!SyncError::Storage(DbError::Corrupt("header".into())).is_retryable());
        assert!(!SyncError::Shutdown.is_retryable());
    }

    #[test]
    fn checksum_mismatch_keeps_bucket_names() {
        let err: SyncError = DbError::ChecksumMismatch {
            failed_buckets: vec!["b1".into()],
        }
        .into();
        match err {
            SyncError::ChecksumMismatch { failed_buckets } => assert_eq!(failed_buckets, ["b1"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::ChecksumMismatch {
            failed_buckets: vec!["todos".into()],
        };
        assert!(err.to_string().contains("todos"));
        assert!(SyncError::Unauthorized("401".into()).is_auth_error());
    }
}
