//! # basin-db: Storage Layer for Basin
//!
//! Everything that touches the embedded SQLite database lives here.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Basin Data Flow                                  │
//! │                                                                         │
//! │  application                        basin-sync                          │
//! │   │  execute / get_all / watch       │  save_sync_data / apply / crud   │
//! │   ▼                                  ▼                                  │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     basin-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   Database ──► BucketStorage   CrudRepository   WatchedQuery    │   │
//! │  │       │              │               │               ▲          │   │
//! │  │       ▼              ▼               ▼               │          │   │
//! │  │   ConnectionPool (1 writer, N readers) ── TableUpdates ┘        │   │
//! │  │                                                                 │   │
//! │  │   InstanceRegistry: one slot per open database file             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite (WAL): ps_* bookkeeping + ps_data__<table> + views              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Single-writer / multi-reader pool with change notifications
//! - [`migrations`] - Embedded migrations for the internal tables
//! - [`schema`] - Application tables as views with CRUD-capturing triggers
//! - [`repository`] - Bucket storage and the CRUD log
//! - [`watch`] / [`throttle`] - Live queries
//! - [`registry`] - Duplicate instance detection
//! - [`database`] - The facade applications hold
//!
//! ## Usage
//!
//! ```rust,ignore
//! use basin_db::{Database, DatabaseOptions, InstanceRegistry, PoolConfig, Schema};
//!
//! let options = DatabaseOptions::new(PoolConfig::new("app.db"), schema);
//! let db = Database::open(options, InstanceRegistry::global()).await?;
//!
//! db.execute("INSERT INTO todos (id, title) VALUES (?, ?)", vec!["t1".into(), "hi".into()]).await?;
//! let mut todos = db.watch("SELECT * FROM todos", vec![], &["todos"]);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod database;
pub mod error;
pub mod migrations;
pub mod params;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod schema;
pub mod throttle;
pub mod watch;

// =============================================================================
// Re-exports
// =============================================================================

pub use database::{Database, DatabaseOptions};
pub use error::{DbError, DbResult};
pub use params::SqlParam;
pub use pool::{ConnectionPool, PoolConfig, TableUpdates};
pub use registry::{InstanceHandle, InstanceRegistry};
pub use repository::{ApplyOutcome, BucketStorage, CrudBatch, CrudRepository, CrudTransaction};
pub use schema::{Column, ColumnType, Schema, Table};
pub use throttle::throttled;
pub use watch::WatchedQuery;

// Re-exported so callers can name row types without depending on sqlx.
pub use sqlx::sqlite::SqliteRow;
