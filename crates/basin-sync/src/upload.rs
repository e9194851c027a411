//! # CRUD Upload Queue
//!
//! Hands local writes to the connector, one transaction at a time, in the
//! order they were made.
//!
//! ## Upload Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CrudUploadQueue Loop                              │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │ 1. next_crud_transaction()                                        │ │
//! │  │       │ none ──► update_local_target(write checkpoint) ──► 4.     │ │
//! │  │       ▼                                                           │ │
//! │  │ 2. connector.upload_data(tx)                                      │ │
//! │  │       │ error ──► upload_error, sleep crud_retry_delay ──► 1.     │ │
//! │  │       ▼           (same transaction comes back: never skipped)    │ │
//! │  │ 3. tx.complete(write_checkpoint) unless the connector did ──► 1.  │ │
//! │  │                                                                   │ │
//! │  │ 4. wait: ps_crud changed │ trigger() │ shutdown                   │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  Runs whether or not the sync stream is connected.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use basin_db::{CrudTransaction, Database, TableUpdates};

use crate::config::SyncConfig;
use crate::connector::BackendConnector;
use crate::credentials::CredentialManager;
use crate::error::{SyncError, SyncResult};
use crate::status::StatusPublisher;
use crate::transport::SyncTransport;

/// Table the view triggers append local writes to.
const CRUD_TABLE: &str = "ps_crud";

// =============================================================================
// Handles
// =============================================================================

/// Wakes the upload queue without a table change.
#[derive(Debug, Clone, Default)]
pub struct UploadTrigger(Arc<Notify>);

impl UploadTrigger {
    /// Requests an upload pass. Triggers coalesce while one is pending.
    pub fn trigger(&self) {
        self.0.notify_one();
    }

    async fn triggered(&self) {
        self.0.notified().await;
    }
}

/// Handle for controlling a running upload queue.
#[derive(Debug)]
pub struct UploadHandle {
    shutdown_tx: mpsc::Sender<()>,
    trigger: UploadTrigger,
    task: JoinHandle<()>,
}

impl UploadHandle {
    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    /// Stops the queue and waits for it. An upload in flight is abandoned
    /// and retried on the next start.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Upload task ended abnormally");
        }
    }
}

enum Pass {
    Drained,
    Shutdown,
}

// =============================================================================
// Queue
// =============================================================================

pub struct CrudUploadQueue {
    db: Arc<Database>,
    credentials: Arc<CredentialManager<dyn BackendConnector>>,
    transport: Arc<dyn SyncTransport>,
    config: Arc<SyncConfig>,
    status: StatusPublisher,
    trigger: UploadTrigger,
}

impl CrudUploadQueue {
    pub fn new(
        db: Arc<Database>,
        credentials: Arc<CredentialManager<dyn BackendConnector>>,
        transport: Arc<dyn SyncTransport>,
        config: Arc<SyncConfig>,
        status: StatusPublisher,
        trigger: UploadTrigger,
    ) -> Self {
        CrudUploadQueue {
            db,
            credentials,
            transport,
            config,
            status,
            trigger,
        }
    }

    /// Spawns the queue on the current runtime.
    pub fn spawn(self) -> UploadHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let trigger = self.trigger.clone();
        // Subscribe before the first look at the log so no write slips by.
        let updates = self.db.pool().update_notifications();
        let task = tokio::spawn(self.run(updates, shutdown_rx));
        UploadHandle {
            shutdown_tx,
            trigger,
            task,
        }
    }

    async fn run(
        self,
        mut updates: broadcast::Receiver<TableUpdates>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Upload queue starting");
        let mut last_uploaded: Option<i64> = None;

        loop {
            match self.upload_all(&mut shutdown_rx, &mut last_uploaded).await {
                Pass::Shutdown => break,
                Pass::Drained => {}
            }

            if let Err(e) = self.update_local_target().await {
                debug!(error = %e, "Could not update the local write target");
            }

            if !self.wait_for_work(&mut updates, &mut shutdown_rx).await {
                break;
            }
        }

        self.status.update(|s| s.uploading = false);
        info!("Upload queue stopped");
    }

    /// Uploads until the log is empty.
    async fn upload_all(
        &self,
        shutdown_rx: &mut mpsc::Receiver<()>,
        last_uploaded: &mut Option<i64>,
    ) -> Pass {
        loop {
            let next = match self.db.next_crud_transaction().await {
                Ok(next) => next,
                Err(e) => {
                    let e = SyncError::from(e);
                    if !e.is_retryable() {
                        warn!(error = %e, "CRUD log unavailable, stopping uploads");
                        return Pass::Shutdown;
                    }
                    self.record_failure(&e);
                    if !self.retry_delay(shutdown_rx).await {
                        return Pass::Shutdown;
                    }
                    continue;
                }
            };
            let Some(transaction) = next else {
                self.status.update(|s| s.uploading = false);
                return Pass::Drained;
            };

            let first = transaction.crud.first().map(|e| e.client_id);
            if first.is_some() && first == *last_uploaded {
                warn!(
                    client_id = ?first,
                    "Potentially previously uploaded CRUD entries are still present in the upload \
                     queue. Make sure to handle uploads and complete CRUD transactions by calling \
                     and awaiting their complete() method"
                );
                if !self.retry_delay(shutdown_rx).await {
                    return Pass::Shutdown;
                }
            }

            self.status.update(|s| s.uploading = true);
            debug!(
                transaction_id = ?transaction.transaction_id,
                entries = transaction.crud.len(),
                "Uploading CRUD transaction"
            );

            let uploaded = tokio::select! {
                result = self.credentials.connector().upload_data(&transaction) => result,
                _ = shutdown_rx.recv() => return Pass::Shutdown,
            };

            match self.finish(&transaction, uploaded).await {
                Ok(()) => {
                    *last_uploaded = first;
                    self.status.update(|s| s.upload_error = None);
                }
                Err(e) => {
                    self.record_failure(&e);
                    if !self.retry_delay(shutdown_rx).await {
                        return Pass::Shutdown;
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        transaction: &CrudTransaction,
        uploaded: SyncResult<Option<String>>,
    ) -> SyncResult<()> {
        let write_checkpoint = uploaded?;
        if !transaction.is_completed() {
            transaction.complete(write_checkpoint).await?;
        }
        Ok(())
    }

    fn record_failure(&self, error: &SyncError) {
        warn!(error = %error, "CRUD upload failed, retrying");
        let message = error.to_string();
        self.status.update(|s| {
            s.uploading = false;
            s.upload_error = Some(message);
        });
    }

    /// Sleeps `crud_retry_delay`. Returns `false` if shut down meanwhile.
    async fn retry_delay(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        let delay: Duration = self.config.crud_retry_delay;
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_rx.recv() => false,
        }
    }

    /// Once everything is uploaded, asks the service which checkpoint
    /// contains our writes so synced data can be applied again.
    async fn update_local_target(&self) -> SyncResult<bool> {
        let client_id = self.db.crud().client_id().await?;
        let credentials = self.credentials.clone();
        let transport = self.transport.clone();

        self.db
            .crud()
            .update_local_target(move || async move {
                let creds = credentials.get_cached().await?;
                transport.write_checkpoint(&creds, &client_id).await
            })
            .await
    }

    /// Waits for a change to the CRUD log, a trigger or shutdown.
    ///
    /// ## Returns
    /// `false` on shutdown.
    async fn wait_for_work(
        &self,
        updates: &mut broadcast::Receiver<TableUpdates>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                changed = updates.recv() => match changed {
                    Ok(tables) if tables.contains(CRUD_TABLE) => return true,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => return true,
                    Err(RecvError::Closed) => return false,
                },
                _ = self.trigger.triggered() => return true,
                _ = shutdown_rx.recv() => return false,
            }
        }
    }
}
