//! # basin-sync: Sync Engine for Basin
//!
//! Keeps a [`basin_db::Database`] in step with the sync service and pushes
//! local writes to the application's own server.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (connect / disconnect)            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ StreamingSync  │  │ CrudUpload     │  │  CredentialManager     │    │
//! │  │ Client         │  │ Queue          │  │                        │    │
//! │  │                │  │                │  │ Caches the connector's │    │
//! │  │ Checkpoints in,│  │ ps_crud out,   │  │ credentials, one fetch │    │
//! │  │ backoff on     │  │ one tx at a    │  │ in flight at a time    │    │
//! │  │ failure        │  │ time, in order │  │                        │    │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │          │                   │                       │                  │
//! │          ▼                   ▼                       ▼                  │
//! │   SyncTransport        BackendConnector       BackendConnector         │
//! │   (HTTP ndjson)        upload_data()          fetch_credentials()      │
//! │                                                                         │
//! │  STATUS: one watch::Sender<SyncStatus> written by both tasks            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent`, the entry point
//! - [`config`] - Layered configuration (defaults, TOML, env)
//! - [`connector`] - The application-supplied `BackendConnector`
//! - [`credentials`] - Cached, single-flight credentials
//! - [`error`] - Sync error types
//! - [`status`] - Shared observable status
//! - [`streaming`] - The replication stream state machine
//! - [`transport`] - HTTP transport and line splitting
//! - [`upload`] - The CRUD upload loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use basin_sync::{SyncAgentBuilder, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let agent = SyncAgentBuilder::new(config)
//!     .with_database(db.clone())
//!     .with_connector(Arc::new(MyConnector::new()))
//!     .connect()?;
//!
//! agent.wait_for_first_sync().await?;
//! println!("{:?}", agent.current_status().state);
//! agent.disconnect().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod status;
pub mod streaming;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{SyncAgent, SyncAgentBuilder};
pub use config::SyncConfig;
pub use connector::BackendConnector;
pub use credentials::CredentialManager;
pub use error::{SyncError, SyncResult};
pub use status::StatusPublisher;
pub use streaming::{StreamingSyncClient, SyncHandle};
pub use transport::{split_lines, HttpTransport, LineStream, SyncTransport};
pub use upload::{CrudUploadQueue, UploadHandle, UploadTrigger};
