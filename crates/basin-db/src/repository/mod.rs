//! # Repository Module
//!
//! SQL for the internal sync tables, grouped by concern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.buckets()  ──► BucketStorage    ps_buckets, ps_oplog, ps_staging,   │
//! │                                     ps_updated_rows, ps_data__*         │
//! │                                                                         │
//! │  db.crud()     ──► CrudRepository   ps_crud, ps_tx, ps_kv,              │
//! │                                     ps_buckets['$local']                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both are cheap to clone and share the database's [`ConnectionPool`].
//!
//! [`ConnectionPool`]: crate::pool::ConnectionPool

pub mod bucket;
pub mod crud;

pub use bucket::{ApplyOutcome, BucketStorage};
pub use crud::{CrudBatch, CrudRepository, CrudTransaction};
