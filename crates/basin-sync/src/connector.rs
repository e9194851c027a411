//! # Backend Connector
//!
//! The application's side of the contract: where credentials come from and
//! how local writes reach the application server.

use async_trait::async_trait;

use basin_core::Credentials;
use basin_db::CrudTransaction;

use crate::error::SyncResult;

/// Supplied by the application, one per backend.
///
/// Wrap it in a [`CredentialManager`] for caching and single-flight
/// fetching instead of implementing either here.
///
/// [`CredentialManager`]: crate::credentials::CredentialManager
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Fetches fresh credentials. `Ok(None)` means the user is signed out.
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>>;

    /// Uploads one transaction to the application server.
    ///
    /// ## Returns
    /// The server's write checkpoint covering this upload, if it reports
    /// one. The upload queue completes the transaction afterwards unless
    /// the connector already called [`CrudTransaction::complete`] itself,
    /// for example to discard an entry the server will never accept.
    async fn upload_data(&self, transaction: &CrudTransaction) -> SyncResult<Option<String>>;
}
