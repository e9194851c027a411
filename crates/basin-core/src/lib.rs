//! # basin-core: Protocol and Domain Types
//!
//! Pure data types for the basin sync client. Nothing in this crate performs
//! I/O; the storage layer (`basin-db`) and the network layer (`basin-sync`)
//! both build on it.
//!
//! ## Where These Types Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   remote service ──► SyncLine ──► Checkpoint / SyncDataBucket ──► db    │
//! │                                                                         │
//! │   db ──► CrudEntry (grouped by transaction) ──► application server      │
//! │                                                                         │
//! │   Credentials gate every request; SyncStatus reports what happened.     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Op ids, checksums, checkpoints and the line protocol
//! - [`crud`] - Locally captured writes waiting for upload
//! - [`credentials`] - Endpoint + token pairs handed out by a connector
//! - [`status`] - Observable sync status snapshots
//! - [`error`] - Domain error types

pub mod credentials;
pub mod crud;
pub mod error;
pub mod protocol;
pub mod status;

pub use credentials::Credentials;
pub use crud::{CrudEntry, UpdateType, UploadQueueStats};
pub use error::{CoreError, CoreResult};
pub use protocol::*;
pub use status::*;

/// Bucket name reserved for tracking the local write target.
pub const LOCAL_BUCKET: &str = "$local";

/// Largest op id. Used as the `$local` target while local writes are unacknowledged.
pub const MAX_OP_ID: &str = "9223372036854775807";
