//! # Credential Manager
//!
//! Caches the connector's credentials and makes sure only one fetch runs at
//! a time.
//!
//! ## Fetch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  get_cached()                                                           │
//! │    cached and not expired? ──yes──► return it (no network)              │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │    lock fetch_lock ──► cached now? (another caller fetched) ──► return  │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │    connector.fetch_credentials() ──► store ──► return                   │
//! │                                                                         │
//! │  refresh_if_idle()                                                      │
//! │    try_lock fetch_lock ──busy──► no-op                                  │
//! │        │ acquired                                                       │
//! │        ▼                                                                │
//! │    fetch ──► replace cache   (readers keep the old token meanwhile)     │
//! │                                                                         │
//! │  invalidate()  ──► cache = None                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use basin_core::Credentials;

use crate::connector::BackendConnector;
use crate::error::{SyncError, SyncResult};

/// Caching, single-flight wrapper around a [`BackendConnector`].
pub struct CredentialManager<C: ?Sized> {
    connector: Arc<C>,
    cached: RwLock<Option<Credentials>>,
    fetch_lock: Mutex<()>,
}

impl<C: BackendConnector + ?Sized> CredentialManager<C> {
    pub fn new(connector: Arc<C>) -> Self {
        CredentialManager {
            connector,
            cached: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// Returns the cached credentials, fetching once if there are none.
    ///
    /// Concurrent callers wait for the same fetch.
    ///
    /// ## Errors
    /// `SyncError::NotSignedIn` when the connector returns `None`; any
    /// connector error as is.
    pub async fn get_cached(&self) -> SyncResult<Credentials> {
        if let Some(creds) = self.current().await {
            return Ok(creds);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(creds) = self.current().await {
            debug!("Credentials fetched by a concurrent caller");
            return Ok(creds);
        }

        self.fetch_and_store().await
    }

    /// Drops the cached credentials. The next [`get_cached`] fetches.
    ///
    /// [`get_cached`]: Self::get_cached
    pub async fn invalidate(&self) {
        if self.cached.write().await.take().is_some() {
            info!("Credentials invalidated");
        }
    }

    /// Fetches new credentials unless a fetch is already running.
    ///
    /// ## Returns
    /// `true` if this call fetched.
    pub async fn refresh_if_idle(&self) -> SyncResult<bool> {
        let Ok(_guard) = self.fetch_lock.try_lock() else {
            debug!("Credential fetch already in flight, skipping refresh");
            return Ok(false);
        };
        self.fetch_and_store().await?;
        Ok(true)
    }

    /// Cached credentials that have not expired yet.
    async fn current(&self) -> Option<Credentials> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| !c.expires_within(Utc::now(), chrono::Duration::zero()))
            .cloned()
    }

    async fn fetch_and_store(&self) -> SyncResult<Credentials> {
        let fetched = self.connector.fetch_credentials().await;
        match fetched {
            Ok(Some(creds)) => {
                info!(endpoint = %creds.endpoint, expires_at = ?creds.expires_at, "Credentials fetched");
                *self.cached.write().await = Some(creds.clone());
                Ok(creds)
            }
            Ok(None) => {
                *self.cached.write().await = None;
                Err(SyncError::NotSignedIn)
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch credentials");
                Err(e)
            }
        }
    }
}

impl<C: ?Sized> std::fmt::Debug for CredentialManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use basin_db::CrudTransaction;

    use super::*;

    #[derive(Default)]
    struct SlowConnector {
        fetches: AtomicUsize,
        signed_out: bool,
    }

    #[async_trait]
    impl BackendConnector for SlowConnector {
        async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.signed_out {
                return Ok(None);
            }
            Ok(Some(Credentials::new("https://sync.test", format!("token-{n}"))))
        }

        async fn upload_data(&self, _tx: &CrudTransaction) -> SyncResult<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let connector = Arc::new(SlowConnector::default());
        let manager = Arc::new(CredentialManager::new(connector.clone()));

        let (a, b, c) = tokio::join!(
            manager.get_cached(),
            manager.get_cached(),
            manager.get_cached()
        );

        assert_eq!(connector.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().token, "token-1");
        assert_eq!(b.unwrap().token, "token-1");
        assert_eq!(c.unwrap().token, "token-1");

        // Served from cache afterwards.
        manager.get_cached().await.unwrap();
        assert_eq!(connector.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_a_new_fetch() {
        let connector = Arc::new(SlowConnector::default());
        let manager = CredentialManager::new(connector.clone());

        manager.get_cached().await.unwrap();
        manager.invalidate().await;
        let creds = manager.get_cached().await.unwrap();

        assert_eq!(creds.token, "token-2");
        assert_eq!(connector.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_if_idle_skips_while_fetching() {
        let connector = Arc::new(SlowConnector::default());
        let manager = Arc::new(CredentialManager::new(connector.clone()));
        manager.get_cached().await.unwrap();

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_if_idle().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The old token is still served while the refresh runs.
        assert_eq!(manager.get_cached().await.unwrap().token, "token-1");
        assert!(!manager.refresh_if_idle().await.unwrap());

        assert!(first.await.unwrap().unwrap());
        assert_eq!(manager.get_cached().await.unwrap().token, "token-2");
        assert_eq!(connector.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn signed_out_is_reported() {
        let connector = Arc::new(SlowConnector {
            signed_out: true,
            ..Default::default()
        });
        let manager = CredentialManager::new(connector);

        assert!(matches!(
            manager.get_cached().await,
            Err(SyncError::NotSignedIn)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_credentials_are_refetched() {
        let connector = Arc::new(SlowConnector::default());
        let manager = CredentialManager::new(connector.clone());
        *manager.cached.write().await = Some(
            Credentials::new("https://sync.test", "stale")
                .with_expiry(Utc::now() - chrono::Duration::seconds(1)),
        );

        assert_eq!(manager.get_cached().await.unwrap().token, "token-1");
    }
}
