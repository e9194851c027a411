//! # Streaming Sync Client
//!
//! Keeps one replication stream open and applies what it delivers.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Streaming Sync States                                │
//! │                                                                         │
//! │  ┌──────┐  spawn   ┌────────────┐  stream open  ┌───────────┐          │
//! │  │ Idle │ ───────► │ Connecting │ ────────────► │ Streaming │          │
//! │  └──────┘          └─────┬──────┘               └─────┬─────┘          │
//! │                          ▲                            │                 │
//! │          backoff expired │          network/protocol  │                 │
//! │                          │          error             ▼                 │
//! │                   ┌──────┴───────┐              ┌─────────┐            │
//! │                   │ Reconnecting │ ◄─────────── │  Error  │            │
//! │                   └──────────────┘              └─────────┘            │
//! │                                                                         │
//! │  Token expired: back to Connecting at once.                            │
//! │  Checksum mismatch: back to Connecting after the next backoff step.    │
//! │  Backoff resets once a checkpoint applies cleanly.                     │
//! │  disconnect() from any state ──► Stopped (after a running apply).      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Line Handling
//! | Line                          | Effect                                   |
//! |-------------------------------|------------------------------------------|
//! | `checkpoint`                  | new target, drop buckets not listed      |
//! | `checkpoint_diff`             | patch the current target                 |
//! | `data`                        | stage oplog entries                      |
//! | `partial_checkpoint_complete` | apply buckets up to a priority           |
//! | `checkpoint_complete`         | apply everything                         |
//! | `token_expires_in`            | refresh credentials, nudge uploads       |

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use basin_core::{
    BucketPriority, Checkpoint, ConnectionState, StreamingSyncRequest, SyncDownloadProgress,
    SyncLine, SyncStatus,
};
use basin_db::{Database, DbError};

use crate::config::SyncConfig;
use crate::connector::BackendConnector;
use crate::credentials::CredentialManager;
use crate::error::{SyncError, SyncResult};
use crate::status::StatusPublisher;
use crate::transport::{LineStream, SyncTransport};
use crate::upload::UploadTrigger;

// =============================================================================
// Handle
// =============================================================================

/// Handle for a running [`StreamingSyncClient`].
#[derive(Debug)]
pub struct SyncHandle {
    shutdown_tx: mpsc::Sender<()>,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stops syncing.
    ///
    /// The network request is cancelled right away; a checkpoint being
    /// applied is committed first. Returns once the client reached
    /// [`ConnectionState::Stopped`].
    pub async fn disconnect(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sync task ended abnormally");
        }
    }
}

/// How one connection ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum Iteration {
    /// Reconnect immediately.
    Restart,
    /// Reconnect after the next backoff step, to download failed buckets again.
    Resync,
    /// The service closed the stream.
    Ended,
    Shutdown,
}

// =============================================================================
// Client
// =============================================================================

pub struct StreamingSyncClient {
    db: Arc<Database>,
    credentials: Arc<CredentialManager<dyn BackendConnector>>,
    transport: Arc<dyn SyncTransport>,
    config: Arc<SyncConfig>,
    status: StatusPublisher,
    uploads: UploadTrigger,
}

impl StreamingSyncClient {
    pub fn new(
        db: Arc<Database>,
        credentials: Arc<CredentialManager<dyn BackendConnector>>,
        transport: Arc<dyn SyncTransport>,
        config: Arc<SyncConfig>,
        status: StatusPublisher,
        uploads: UploadTrigger,
    ) -> Self {
        StreamingSyncClient {
            db,
            credentials,
            transport,
            config,
            status,
            uploads,
        }
    }

    /// Spawns the client on the current runtime.
    pub fn spawn(self) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        SyncHandle {
            shutdown_tx,
            status,
            task,
        }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let lock = self.db.instance().sync_lock();
        let _sync_guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    identifier = %self.db.instance().identifier(),
                    "Another instance is syncing this database, waiting for it to stop"
                );
                tokio::select! {
                    guard = lock.lock_owned() => guard,
                    _ = shutdown_rx.recv() => {
                        self.stopped();
                        return;
                    }
                }
            }
        };

        self.load_persisted_status().await;
        let mut backoff = self.create_backoff();

        loop {
            self.status.update(|s| {
                s.state = ConnectionState::Connecting;
                s.connecting = true;
            });

            match self.iteration(&mut shutdown_rx, &mut backoff).await {
                Ok(Iteration::Shutdown) => break,
                Ok(Iteration::Restart) => continue,
                Ok(Iteration::Resync) => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    info!(?delay, "Downloading rejected buckets again");
                    self.disconnected(None);
                    if !self.sleep(delay, &mut shutdown_rx).await {
                        break;
                    }
                }
                Ok(Iteration::Ended) => {
                    debug!("Sync stream closed by the service");
                    self.disconnected(None);
                    if !self.sleep(self.config.retry_delay, &mut shutdown_rx).await {
                        break;
                    }
                }
                Err(SyncError::Shutdown) => break,
                Err(e) => {
                    if e.is_auth_error() {
                        self.credentials.invalidate().await;
                    }
                    if matches!(e, SyncError::Storage(_)) && !e.is_retryable() {
                        warn!(error = %e, "Local database unavailable, stopping sync");
                        self.disconnected(Some(e.to_string()));
                        break;
                    }

                    let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    warn!(error = %e, ?delay, "Sync stream failed, reconnecting");
                    self.disconnected(Some(e.to_string()));
                    self.status
                        .update(|s| s.state = ConnectionState::Reconnecting);

                    if !self.sleep(delay, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        self.stopped();
    }

    /// One connection, from credentials to the end of the stream.
    async fn iteration(
        &self,
        shutdown_rx: &mut mpsc::Receiver<()>,
        backoff: &mut ExponentialBackoff,
    ) -> SyncResult<Iteration> {
        let mut lines = tokio::select! {
            opened = self.open() => opened?,
            _ = shutdown_rx.recv() => return Ok(Iteration::Shutdown),
        };

        self.status.update(|s| {
            s.state = ConnectionState::Streaming;
            s.connected = true;
            s.connecting = false;
        });
        info!("Sync stream open");

        let mut target: Option<Checkpoint> = None;
        loop {
            // Only the wait for the next line races shutdown. Once a line is
            // in hand it is handled to the end, so an apply is never cut off.
            let line = tokio::select! {
                line = lines.next() => line,
                _ = shutdown_rx.recv() => return Ok(Iteration::Shutdown),
            };
            let Some(line) = line else {
                return Ok(Iteration::Ended);
            };

            let line = SyncLine::parse(&line?)?;
            if let Some(outcome) = self.handle_line(line, &mut target, backoff).await? {
                return Ok(outcome);
            }
        }
    }

    async fn open(&self) -> SyncResult<LineStream> {
        let credentials = self.credentials.get_cached().await?;
        let states = self.db.bucket_storage().bucket_states().await?;

        let mut request = StreamingSyncRequest::from_states(&states, self.config.include_checksum);
        request.client_id = Some(self.db.crud().client_id().await?);
        request.parameters = self.config.parameters.clone();

        debug!(
            endpoint = %credentials.endpoint,
            buckets = states.len(),
            "Requesting sync stream"
        );
        self.transport.open_stream(&credentials, &request).await
    }

    /// Handles one line. `Some` ends the connection.
    async fn handle_line(
        &self,
        line: SyncLine,
        target: &mut Option<Checkpoint>,
        backoff: &mut ExponentialBackoff,
    ) -> SyncResult<Option<Iteration>> {
        match line {
            SyncLine::Checkpoint(checkpoint) => {
                debug!(
                    last_op_id = %checkpoint.last_op_id,
                    buckets = checkpoint.checksums.len(),
                    "Received checkpoint"
                );
                let storage = self.db.bucket_storage();
                let removed: Vec<String> = storage
                    .bucket_names()
                    .await?
                    .into_iter()
                    .filter(|name| checkpoint.bucket(name).is_none())
                    .collect();
                storage.remove_buckets(removed).await?;
                self.set_target(checkpoint, target).await?;
            }

            SyncLine::CheckpointDiff(diff) => {
                let Some(base) = target.as_ref() else {
                    return Err(SyncError::Protocol(
                        "checkpoint_diff without a previous checkpoint".into(),
                    ));
                };
                debug!(
                    last_op_id = %diff.last_op_id,
                    updated = diff.updated_buckets.len(),
                    removed = diff.removed_buckets.len(),
                    "Received checkpoint diff"
                );
                let next = base.apply_diff(&diff);
                self.db
                    .bucket_storage()
                    .remove_buckets(diff.removed_buckets)
                    .await?;
                self.set_target(next, target).await?;
            }

            SyncLine::Data(data) => {
                let (bucket, ops) = (data.bucket.clone(), data.data.len());
                self.db.bucket_storage().save_sync_data(data).await?;
                self.status.update(|s| {
                    s.downloading = true;
                    if let Some(progress) = &mut s.download_progress {
                        if !progress.record_data(&bucket, ops) {
                            debug!(bucket = %bucket, "Data for a bucket outside the checkpoint");
                        }
                    }
                });
            }

            SyncLine::PartialCheckpointComplete { priority, .. } => {
                let Some(checkpoint) = target.as_ref() else {
                    return Err(SyncError::Protocol(
                        "partial_checkpoint_complete without a checkpoint".into(),
                    ));
                };
                return self.apply(checkpoint, Some(priority), backoff).await;
            }

            SyncLine::CheckpointComplete { .. } => {
                let Some(checkpoint) = target.as_ref() else {
                    return Err(SyncError::Protocol(
                        "checkpoint_complete without a checkpoint".into(),
                    ));
                };
                return self.apply(checkpoint, None, backoff).await;
            }

            SyncLine::KeepAlive { token_expires_in } => {
                if token_expires_in <= 0 {
                    info!("Token expired, reconnecting with new credentials");
                    self.credentials.invalidate().await;
                    return Ok(Some(Iteration::Restart));
                }
                let margin = self.config.token_refresh_margin.as_secs();
                if u64::try_from(token_expires_in).unwrap_or(0) < margin {
                    debug!(token_expires_in, "Token about to expire, refreshing");
                    let credentials = self.credentials.clone();
                    tokio::spawn(async move {
                        if let Err(e) = credentials.refresh_if_idle().await {
                            warn!(error = %e, "Background credential refresh failed");
                        }
                    });
                }
                self.uploads.trigger();
            }

            SyncLine::Unknown => debug!("Ignoring unknown sync line"),
        }
        Ok(None)
    }

    async fn set_target(
        &self,
        checkpoint: Checkpoint,
        target: &mut Option<Checkpoint>,
    ) -> SyncResult<()> {
        self.db
            .bucket_storage()
            .set_target_checkpoint(&checkpoint)
            .await?;
        let progress = SyncDownloadProgress::for_checkpoint(&checkpoint);
        self.status.update(|s| {
            s.downloading = true;
            s.download_progress = Some(match &s.download_progress {
                Some(previous) => progress.continued_from(previous),
                None => progress,
            });
        });
        *target = Some(checkpoint);
        Ok(())
    }

    /// Applies `checkpoint`, fully or up to `priority`.
    async fn apply(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<BucketPriority>,
        backoff: &mut ExponentialBackoff,
    ) -> SyncResult<Option<Iteration>> {
        let storage = self.db.bucket_storage();
        let outcome = storage.apply_checkpoint(checkpoint, priority).await;
        if outcome.is_ok() {
            backoff.reset();
        }
        match outcome {
            Ok(outcome) if outcome.ready => {
                let now = Utc::now();
                self.status.update(|s| match priority {
                    Some(p) => s.record_priority_synced(p, now),
                    None => s.record_full_sync(now),
                });
                Ok(None)
            }
            Ok(_) => {
                info!(
                    last_op_id = %checkpoint.last_op_id,
                    "Local changes pending, synced data deferred until they are uploaded"
                );
                self.uploads.trigger();
                Ok(None)
            }
            Err(DbError::ChecksumMismatch { failed_buckets }) => {
                // Not fatal: those buckets start over on a fresh connection.
                storage.reset_buckets(failed_buckets).await?;
                Ok(Some(Iteration::Resync))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Seeds `has_synced` / `last_synced_at` from storage.
    async fn load_persisted_status(&self) {
        match self.db.bucket_storage().last_synced_at().await {
            Ok(last) => self.status.update(|s| {
                if last.is_some() {
                    s.has_synced = Some(true);
                    s.last_synced_at = last;
                } else if s.has_synced.is_none() {
                    s.has_synced = Some(false);
                }
            }),
            Err(e) => warn!(error = %e, "Could not read the last sync time"),
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_delay)
            .with_max_interval(self.config.max_backoff)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }

    fn disconnected(&self, error: Option<String>) {
        self.status.update(|s| {
            s.state = if error.is_some() {
                ConnectionState::Error
            } else {
                ConnectionState::Connecting
            };
            s.connected = false;
            s.connecting = true;
            s.downloading = false;
            if error.is_some() {
                s.download_error = error;
            }
        });
    }

    fn stopped(&self) {
        self.status.update(|s| {
            s.state = ConnectionState::Stopped;
            s.connected = false;
            s.connecting = false;
            s.downloading = false;
        });
        info!("Streaming sync stopped");
    }

    /// Returns `false` if shut down while sleeping.
    async fn sleep(&self, delay: std::time::Duration, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_rx.recv() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use basin_core::{BucketChecksum, OpId, OplogEntry, SyncDataBucket};

    use super::*;
    use crate::testing::{open_db, TestConnector, WAIT};
    use crate::transport::mock::MockTransport;

    struct Harness {
        db: Arc<Database>,
        connector: Arc<TestConnector>,
        transport: Arc<MockTransport>,
        handle: SyncHandle,
        status: watch::Receiver<SyncStatus>,
    }

    async fn start_with(config: SyncConfig, transport: Arc<MockTransport>) -> Harness {
        let db = open_db().await;
        let connector = Arc::new(TestConnector::default());
        let client = StreamingSyncClient::new(
            db.clone(),
            connector.manager(),
            transport.clone(),
            Arc::new(config),
            StatusPublisher::default(),
            UploadTrigger::default(),
        );
        let handle = client.spawn();
        let status = handle.status();
        Harness {
            db,
            connector,
            transport,
            handle,
            status,
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig::default().with_retry_delay(Duration::from_millis(10))
    }

    fn send(tx: &mpsc::UnboundedSender<SyncResult<String>>, line: SyncLine) {
        tx.send(Ok(line.to_value().to_string())).unwrap();
    }

    fn data(bucket: &str, ops: Vec<OplogEntry>) -> SyncLine {
        SyncLine::Data(SyncDataBucket {
            bucket: bucket.into(),
            data: ops,
            has_more: false,
            after: None,
            next_after: None,
        })
    }

    fn complete() -> SyncLine {
        SyncLine::CheckpointComplete { last_op_id: None }
    }

    async fn wait_status(h: &mut Harness, f: impl FnMut(&SyncStatus) -> bool) -> SyncStatus {
        tokio::time::timeout(WAIT, h.status.wait_for(f))
            .await
            .expect("status not reached")
            .expect("status channel closed")
            .clone()
    }

    async fn user_name(db: &Database, id: &str) -> Option<String> {
        db.get_optional("SELECT name FROM users WHERE id = ?", vec![id.into()])
            .await
            .unwrap()
            .and_then(|row| row.get("name").and_then(|v| v.as_str().map(String::from)))
    }

    #[tokio::test]
    async fn applies_a_fresh_checkpoint() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let mut h = start_with(fast_config(), transport).await;

        send(
            &lines,
            SyncLine::Checkpoint(Checkpoint::new(10, vec![BucketChecksum::new("b1", 42u32)])),
        );
        send(
            &lines,
            data("b1", vec![OplogEntry::put(10, "users", "1", json!({"name": "Ada"}), 42)]),
        );
        send(&lines, complete());

        let status = wait_status(&mut h, |s| s.has_synced == Some(true)).await;
        assert!(status.connected);
        assert!(status.download_error.is_none());
        assert_eq!(status.download_progress.unwrap().overall().fraction(), 1.0);

        let states = h.db.bucket_storage().bucket_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].bucket, "b1");
        assert_eq!(states[0].op_id, OpId(10));
        assert_eq!(user_name(&h.db, "1").await.as_deref(), Some("Ada"));

        let request = &h.transport.requests()[0];
        assert!(request.include_checksum);
        assert!(request.buckets.is_empty());
        assert!(request.client_id.is_some());

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn checksum_mismatch_resyncs_only_the_failed_bucket() {
        let transport = Arc::new(MockTransport::default());
        let first = transport.session();
        let second = transport.session();
        let mut h = start_with(fast_config(), transport).await;

        let checkpoint = Checkpoint::new(
            10,
            vec![BucketChecksum::new("b1", 42u32), BucketChecksum::new("b2", 5u32)],
        );
        send(&first, SyncLine::Checkpoint(checkpoint.clone()));
        send(&first, data("b1", vec![OplogEntry::put(9, "users", "1", json!({"name": "x"}), 7)]));
        send(&first, data("b2", vec![OplogEntry::put(10, "users", "2", json!({"name": "Bo"}), 5)]));
        send(&first, complete());

        h.transport.wait_for_requests(2).await;
        let retry = &h.transport.requests()[1];
        let b1 = retry.buckets.iter().find(|b| b.name == "b1").unwrap();
        assert_eq!(b1.after, OpId::ZERO);
        assert!(user_name(&h.db, "1").await.is_none());

        // b2's staged data survived the rejected apply.
        send(&second, SyncLine::Checkpoint(checkpoint));
        send(&second, data("b1", vec![OplogEntry::put(9, "users", "1", json!({"name": "Ada"}), 42)]));
        send(&second, complete());

        let status = wait_status(&mut h, |s| s.has_synced == Some(true)).await;
        assert!(status.download_error.is_none());
        assert_eq!(user_name(&h.db, "1").await.as_deref(), Some("Ada"));
        assert_eq!(user_name(&h.db, "2").await.as_deref(), Some("Bo"));

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn repeated_checksum_mismatches_back_off() {
        let transport = Arc::new(MockTransport::default());
        let checkpoint = Checkpoint::new(10, vec![BucketChecksum::new("b1", 42u32)]);
        let mut sessions = Vec::new();
        for _ in 0..3 {
            let lines = transport.session();
            send(&lines, SyncLine::Checkpoint(checkpoint.clone()));
            send(&lines, data("b1", vec![OplogEntry::put(10, "users", "1", json!({"name": "x"}), 7)]));
            send(&lines, complete());
            sessions.push(lines);
        }

        let started = tokio::time::Instant::now();
        let config = SyncConfig::default()
            .with_retry_delay(Duration::from_millis(200))
            .with_max_backoff(Duration::from_secs(2));
        let h = start_with(config, transport).await;

        // Randomized steps of 200ms then 400ms, each at least half that.
        h.transport.wait_for_requests(3).await;
        assert!(started.elapsed() >= Duration::from_millis(290), "{:?}", started.elapsed());
        assert!(user_name(&h.db, "1").await.is_none());

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn data_lines_advance_download_progress() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let mut h = start_with(fast_config(), transport).await;

        send(
            &lines,
            SyncLine::Checkpoint(Checkpoint::new(
                3,
                vec![BucketChecksum::new("b1", 6u32).with_count(3)],
            )),
        );
        send(&lines, data("b1", vec![OplogEntry::put(1, "users", "1", json!({"name": "A"}), 1)]));
        let status = wait_status(&mut h, |s| {
            s.download_progress
                .as_ref()
                .is_some_and(|p| p.overall_operations().downloaded == 1)
        })
        .await;
        let ops = status.download_progress.unwrap().overall_operations();
        assert_eq!(ops.expected, Some(3));
        assert!(!status.has_synced.unwrap_or(false));

        send(
            &lines,
            data(
                "b1",
                vec![
                    OplogEntry::put(2, "users", "2", json!({"name": "B"}), 2),
                    OplogEntry::put(3, "users", "3", json!({"name": "C"}), 3),
                ],
            ),
        );
        let status = wait_status(&mut h, |s| {
            s.download_progress
                .as_ref()
                .is_some_and(|p| p.overall_operations().downloaded == 3)
        })
        .await;
        let progress = status.download_progress.unwrap();
        assert_eq!(progress.overall_operations().fraction(), Some(1.0));
        assert_eq!(progress.overall(), basin_core::ProgressCount { reached: 0, total: 1 });

        send(&lines, complete());
        let status = wait_status(&mut h, |s| s.has_synced == Some(true)).await;
        assert_eq!(status.download_progress.unwrap().overall().fraction(), 1.0);

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn checkpoint_diff_patches_the_target() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let mut h = start_with(fast_config(), transport).await;

        send(
            &lines,
            SyncLine::Checkpoint(Checkpoint::new(1, vec![BucketChecksum::new("b1", 0u32)])),
        );
        send(&lines, complete());
        wait_status(&mut h, |s| s.has_synced == Some(true)).await;

        send(
            &lines,
            SyncLine::CheckpointDiff(basin_core::CheckpointDiff {
                last_op_id: OpId(2),
                updated_buckets: vec![BucketChecksum::new("b1", 3u32)],
                removed_buckets: vec![],
                write_checkpoint: None,
            }),
        );
        send(&lines, data("b1", vec![OplogEntry::put(2, "users", "7", json!({"name": "Cy"}), 3)]));
        send(&lines, complete());

        tokio::time::timeout(WAIT, async {
            while user_name(&h.db, "7").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let states = h.db.bucket_storage().bucket_states().await.unwrap();
        assert_eq!(states[0].op_id, OpId(2));

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn partial_checkpoint_marks_priority_synced() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let mut h = start_with(fast_config(), transport).await;

        send(
            &lines,
            SyncLine::Checkpoint(Checkpoint::new(
                5,
                vec![
                    BucketChecksum::new("urgent", 1u32).with_priority(0),
                    BucketChecksum::new("later", 2u32),
                ],
            )),
        );
        send(&lines, data("urgent", vec![OplogEntry::put(4, "users", "u", json!({"name": "U"}), 1)]));
        send(
            &lines,
            SyncLine::PartialCheckpointComplete {
                last_op_id: None,
                priority: BucketPriority(0),
            },
        );

        let status = wait_status(&mut h, |s| s.is_priority_synced(BucketPriority(0))).await;
        assert_ne!(status.has_synced, Some(true));
        assert!(!status.is_priority_synced(BucketPriority(3)));
        assert_eq!(
            status.download_progress.unwrap().for_priority(BucketPriority(0)).fraction(),
            1.0
        );
        assert_eq!(user_name(&h.db, "u").await.as_deref(), Some("U"));

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn expired_token_reconnects_with_new_credentials() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let h = start_with(fast_config(), transport).await;

        send(&lines, SyncLine::KeepAlive { token_expires_in: 0 });
        h.transport.wait_for_requests(2).await;
        assert_eq!(h.connector.fetches.load(Ordering::SeqCst), 2);

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_in_the_background() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let h = start_with(
            fast_config().with_token_refresh_margin(Duration::from_secs(60)),
            transport,
        )
        .await;

        send(&lines, SyncLine::KeepAlive { token_expires_in: 20 });
        tokio::time::timeout(WAIT, async {
            while h.connector.fetches.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.transport.requests().len(), 1);

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn network_errors_are_reported_and_retried() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_next(|| SyncError::Network("connection refused".into()));
        let mut h = start_with(fast_config(), transport).await;

        let status = wait_status(&mut h, |s| s.download_error.is_some()).await;
        assert!(status.download_error.unwrap().contains("connection refused"));

        h.transport.wait_for_requests(2).await;
        wait_status(&mut h, |s| s.connected).await;

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn unauthorized_invalidates_credentials() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_next(|| SyncError::Unauthorized("HTTP 401".into()));
        let h = start_with(fast_config(), transport).await;

        h.transport.wait_for_requests(2).await;
        assert_eq!(h.connector.fetches.load(Ordering::SeqCst), 2);

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_line_drops_the_connection() {
        let transport = Arc::new(MockTransport::default());
        let lines = transport.session();
        let mut h = start_with(fast_config(), transport).await;

        lines.send(Ok("[1, 2]".into())).unwrap();
        let status = wait_status(&mut h, |s| s.download_error.is_some()).await;
        assert!(status.download_error.unwrap().contains("Protocol"));
        h.transport.wait_for_requests(2).await;

        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_stops_and_releases_the_sync_lock() {
        let transport = Arc::new(MockTransport::default());
        let mut h = start_with(fast_config(), transport).await;
        wait_status(&mut h, |s| s.connected).await;

        let db = h.db.clone();
        let mut status = h.status.clone();
        h.handle.disconnect().await;

        assert_eq!(status.borrow_and_update().state, ConnectionState::Stopped);
        assert!(!status.borrow().connected);
        assert!(db.instance().sync_lock().try_lock().is_ok());
    }
}
