//! Fixtures shared by the unit tests of this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use basin_core::Credentials;
use basin_db::{Column, CrudTransaction, Database, DatabaseOptions, InstanceRegistry, PoolConfig, Schema, Table};

use crate::connector::BackendConnector;
use crate::credentials::CredentialManager;
use crate::error::{SyncError, SyncResult};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn schema() -> Schema {
    Schema::new(vec![
        Table::new("users", vec![Column::text("name")]),
        Table::new("todos", vec![Column::text("title")]),
    ])
}

pub(crate) async fn open_db() -> Arc<Database> {
    let options = DatabaseOptions::new(PoolConfig::in_memory(), schema());
    Arc::new(Database::open(options, &InstanceRegistry::new()).await.unwrap())
}

/// Connector with scripted upload failures that records every call.
#[derive(Default)]
pub(crate) struct TestConnector {
    pub(crate) fetches: AtomicUsize,
    /// Number of upload calls that fail before uploads succeed.
    pub(crate) failing_uploads: AtomicUsize,
    /// First `client_id` of every transaction handed to `upload_data`.
    pub(crate) uploads: Mutex<Vec<i64>>,
    /// Complete transactions from inside `upload_data`.
    pub(crate) completes_itself: bool,
}

impl TestConnector {
    pub(crate) fn failing(times: usize) -> Self {
        TestConnector {
            failing_uploads: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    pub(crate) fn uploads(&self) -> Vec<i64> {
        self.uploads.lock().unwrap().clone()
    }

    pub(crate) fn manager(self: &Arc<Self>) -> Arc<CredentialManager<dyn BackendConnector>> {
        let connector: Arc<dyn BackendConnector> = self.clone();
        Arc::new(CredentialManager::new(connector))
    }
}

#[async_trait]
impl BackendConnector for TestConnector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(Credentials::new("http://sync.test", format!("token-{n}"))))
    }

    async fn upload_data(&self, transaction: &CrudTransaction) -> SyncResult<Option<String>> {
        if let Some(first) = transaction.crud.first() {
            self.uploads.lock().unwrap().push(first.client_id);
        }
        let failed = self
            .failing_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SyncError::Upload("server returned 503".into()));
        }
        if self.completes_itself {
            transaction.complete(None).await?;
        }
        Ok(None)
    }
}
