//! # Sync Agent
//!
//! What an application calls `connect()` on. Starts the streaming client and
//! the upload queue together and stops them together.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • One CredentialManager around the application's connector     │  │
//! │  │  • One StatusPublisher written by both tasks                    │  │
//! │  │  • disconnect() stops downloads first, then uploads             │  │
//! │  └───────────────┬─────────────────────────────────┬────────────────┘  │
//! │                  ▼                                 ▼                    │
//! │  ┌────────────────────────────┐     ┌────────────────────────────┐     │
//! │  │   StreamingSyncClient      │     │     CrudUploadQueue        │     │
//! │  │                            │     │                            │     │
//! │  │  service ──► local db      │────►│  local db ──► app server   │     │
//! │  │                            │nudge│                            │     │
//! │  └────────────────────────────┘     └────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use basin_core::{BucketPriority, SyncStatus};
use basin_db::Database;

use crate::config::SyncConfig;
use crate::connector::BackendConnector;
use crate::credentials::CredentialManager;
use crate::error::{SyncError, SyncResult};
use crate::status::StatusPublisher;
use crate::streaming::{StreamingSyncClient, SyncHandle};
use crate::transport::{HttpTransport, SyncTransport};
use crate::upload::{CrudUploadQueue, UploadHandle, UploadTrigger};

/// A connected database. Dropping it without [`disconnect`] leaves the
/// background tasks running until the runtime shuts down.
///
/// [`disconnect`]: SyncAgent::disconnect
#[derive(Debug)]
pub struct SyncAgent {
    credentials: Arc<CredentialManager<dyn BackendConnector>>,
    status: StatusPublisher,
    sync: SyncHandle,
    upload: UploadHandle,
}

impl SyncAgent {
    /// Starts syncing `db`.
    ///
    /// ## Arguments
    /// * `connector` - Supplies credentials and uploads local writes
    /// * `transport` - Network access to the sync service
    /// * `config` - Retry delays, checksum flag, sync parameters
    pub fn connect(
        db: Arc<Database>,
        connector: Arc<dyn BackendConnector>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
    ) -> SyncResult<SyncAgent> {
        config.validate()?;
        if db.is_closed() {
            return Err(SyncError::Storage(basin_db::DbError::Closed));
        }

        let config = Arc::new(config);
        let credentials = Arc::new(CredentialManager::new(connector));
        let status = StatusPublisher::default();
        let trigger = UploadTrigger::default();

        let upload = CrudUploadQueue::new(
            db.clone(),
            credentials.clone(),
            transport.clone(),
            config.clone(),
            status.clone(),
            trigger.clone(),
        )
        .spawn();

        let sync = StreamingSyncClient::new(
            db.clone(),
            credentials.clone(),
            transport,
            config,
            status.clone(),
            trigger,
        )
        .spawn();

        info!(identifier = %db.instance().identifier(), "Sync agent connected");

        Ok(SyncAgent {
            credentials,
            status,
            sync,
            upload,
        })
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn credentials(&self) -> &Arc<CredentialManager<dyn BackendConnector>> {
        &self.credentials
    }

    /// Asks the upload queue to look at the CRUD log now.
    pub fn trigger_upload(&self) {
        self.upload.trigger();
    }

    /// Waits until a full checkpoint has been applied at least once.
    pub async fn wait_for_first_sync(&self) -> SyncResult<()> {
        self.wait_until(|s| s.has_synced == Some(true)).await
    }

    /// Waits until every bucket at `priority` or more urgent is synced.
    pub async fn wait_for_priority(&self, priority: BucketPriority) -> SyncResult<()> {
        self.wait_until(move |s| s.is_priority_synced(priority)).await
    }

    async fn wait_until(&self, f: impl FnMut(&SyncStatus) -> bool) -> SyncResult<()> {
        let mut rx = self.status.subscribe();
        rx.wait_for(f).await.map_err(|_| SyncError::Shutdown)?;
        Ok(())
    }

    /// Stops downloading, then uploading.
    pub async fn disconnect(self) {
        self.sync.disconnect().await;
        self.upload.shutdown().await;
        info!("Sync agent disconnected");
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncAgent`] that defaults to [`HttpTransport`].
pub struct SyncAgentBuilder {
    config: SyncConfig,
    db: Option<Arc<Database>>,
    connector: Option<Arc<dyn BackendConnector>>,
    transport: Option<Arc<dyn SyncTransport>>,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            db: None,
            connector: None,
            transport: None,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Connects. Must be called inside a tokio runtime.
    pub fn connect(self) -> SyncResult<SyncAgent> {
        let db = self
            .db
            .ok_or_else(|| SyncError::Config("database required".into()))?;
        let connector = self
            .connector
            .ok_or_else(|| SyncError::Config("connector required".into()))?;
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()?),
        };
        SyncAgent::connect(db, connector, transport, self.config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use basin_core::{BucketChecksum, Checkpoint, ConnectionState, OplogEntry, SyncDataBucket, SyncLine};
    use basin_db::SqlParam;

    use super::*;
    use crate::testing::{open_db, TestConnector, WAIT};
    use crate::transport::mock::MockTransport;

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_retry_delay(Duration::from_millis(10))
            .with_crud_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn builder_requires_a_database() {
        let err = SyncAgentBuilder::new(config())
            .with_connector(Arc::new(TestConnector::default()))
            .connect()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn downloads_and_uploads_run_together() {
        let db = open_db().await;
        db.execute(
            "INSERT INTO todos (id, title) VALUES (?, ?)",
            vec![SqlParam::from("t1"), SqlParam::from("local")],
        )
        .await
        .unwrap();

        let transport = Arc::new(MockTransport::default());
        *transport.write_checkpoint.lock().unwrap() = Some("3".into());
        let lines = transport.session();
        let connector = Arc::new(TestConnector::default());
        let agent = SyncAgent::connect(db.clone(), connector.clone(), transport, config()).unwrap();

        let mut checkpoint = Checkpoint::new(3, vec![BucketChecksum::new("b1", 9u32)]);
        checkpoint.write_checkpoint = Some("3".into());
        let send = |line: SyncLine| lines.send(Ok(line.to_value().to_string())).unwrap();
        send(SyncLine::Checkpoint(checkpoint));
        send(SyncLine::Data(SyncDataBucket {
            bucket: "b1".into(),
            data: vec![OplogEntry::put(3, "users", "1", json!({"name": "Ada"}), 9)],
            has_more: false,
            after: None,
            next_after: None,
        }));
        send(SyncLine::CheckpointComplete { last_op_id: None });

        // Synced rows stay deferred until the local write is uploaded and
        // the service's write checkpoint becomes the local target.
        tokio::time::timeout(WAIT, async {
            loop {
                let row = db
                    .get_optional("SELECT target_op FROM ps_buckets WHERE name = '$local'", vec![])
                    .await
                    .unwrap();
                if row.and_then(|r| r.get("target_op").and_then(|v| v.as_i64())) == Some(3) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("local target");
        send(SyncLine::CheckpointComplete { last_op_id: None });

        tokio::time::timeout(WAIT, agent.wait_for_first_sync())
            .await
            .expect("first sync")
            .unwrap();
        assert_eq!(connector.uploads().len(), 1);
        assert_eq!(db.upload_queue_stats(false).await.unwrap().count, 0);
        assert!(agent.current_status().is_priority_synced(BucketPriority(3)));
        let names = db.get_all("SELECT name FROM users", vec![]).await.unwrap();
        assert_eq!(names.len(), 1);

        let mut status = agent.status();
        agent.disconnect().await;
        assert_eq!(status.borrow_and_update().state, ConnectionState::Stopped);
    }
}
