//! # Error Types
//!
//! Domain errors for basin-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  basin-core   CoreError  - malformed op ids, sync lines, CRUD entries   │
//! │  basin-db     DbError    - storage failures (wraps CoreError)           │
//! │  basin-sync   SyncError  - network/protocol/upload (wraps both)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Errors raised while decoding protocol or CRUD data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An op id was not a base-10 integer.
    #[error("Invalid op id: {0}")]
    InvalidOpId(String),

    /// A line of the replication stream could not be decoded.
    ///
    /// ## When This Occurs
    /// - The line is not JSON at all
    /// - The line is JSON but not an object
    /// - A known key carries a body with the wrong shape
    #[error("Invalid sync line: {0}")]
    InvalidSyncLine(String),

    /// A row of the CRUD log carried an unparseable payload.
    #[error("Invalid CRUD entry {client_id}: {reason}")]
    InvalidCrudEntry { client_id: i64, reason: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
