//! # Sync Status
//!
//! Snapshot of what the sync client is doing, published to observers after
//! every state change.
//!
//! ## Connection States
//! ```text
//!            connect()
//!   Idle ───────────────► Connecting ──────► Streaming
//!                            ▲                  │
//!                            │ backoff          │ network / protocol error
//!                            │                  ▼
//!                       Reconnecting ◄──────── Error
//!
//!   disconnect() from any state ──► Stopped
//! ```
//!
//! ## Priorities
//! Buckets declare a priority (lower = more urgent). The service may
//! announce that every bucket up to some priority is complete before the
//! full checkpoint is. Each such announcement is recorded as a
//! [`PriorityStatusEntry`], so a UI can show high-priority data early.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{BucketPriority, Checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Error,
    Reconnecting,
    Stopped,
}

/// Completion record for every bucket at or above `priority`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityStatusEntry {
    pub priority: BucketPriority,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub has_synced: Option<bool>,
}

/// Per-bucket progress toward the pending checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProgress {
    pub bucket: String,
    pub priority: BucketPriority,
    pub reached: bool,
    /// Operations received for this bucket since the checkpoint arrived.
    #[serde(default)]
    pub downloaded_ops: u64,
    /// Bucket size declared by the service, when it sent one.
    #[serde(default)]
    pub expected_ops: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCount {
    pub reached: usize,
    pub total: usize,
}

impl ProgressCount {
    /// Share of buckets that reached the target. An empty set counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.reached as f64 / self.total as f64
        }
    }
}

/// Operations received so far against the declared bucket sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCount {
    pub downloaded: u64,
    /// `None` if any bucket in the set has no declared size.
    pub expected: Option<u64>,
}

impl OperationCount {
    /// `downloaded / expected`, capped at 1. `None` without a known size.
    pub fn fraction(&self) -> Option<f64> {
        match self.expected {
            Some(0) => Some(1.0),
            Some(expected) => Some((self.downloaded as f64 / expected as f64).min(1.0)),
            None => None,
        }
    }
}

/// Download progress for the checkpoint currently being synced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncDownloadProgress {
    pub buckets: Vec<BucketProgress>,
}

impl SyncDownloadProgress {
    /// Starts tracking `checkpoint`; every bucket begins unreached.
    pub fn for_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            buckets: checkpoint
                .checksums
                .iter()
                .map(|c| BucketProgress {
                    bucket: c.bucket.clone(),
                    priority: c.priority(),
                    reached: false,
                    downloaded_ops: 0,
                    expected_ops: c.count.and_then(|n| u64::try_from(n).ok()),
                })
                .collect(),
        }
    }

    /// Keeps the operations already received for buckets that `previous`
    /// was still downloading.
    pub fn continued_from(mut self, previous: &SyncDownloadProgress) -> Self {
        for bucket in &mut self.buckets {
            if let Some(old) = previous
                .buckets
                .iter()
                .find(|b| b.bucket == bucket.bucket && !b.reached)
            {
                bucket.downloaded_ops = old.downloaded_ops;
            }
        }
        self
    }

    /// Counts `ops` received for `bucket`. Returns `false` for a bucket
    /// outside the checkpoint.
    pub fn record_data(&mut self, bucket: &str, ops: usize) -> bool {
        match self.buckets.iter_mut().find(|b| b.bucket == bucket) {
            Some(progress) => {
                progress.downloaded_ops += ops as u64;
                true
            }
            None => false,
        }
    }

    /// Marks every bucket covered by `priority` as reached.
    pub fn mark_reached(&mut self, priority: BucketPriority) {
        for bucket in &mut self.buckets {
            if priority.covers(bucket.priority) {
                bucket.reached = true;
                if let Some(expected) = bucket.expected_ops {
                    bucket.downloaded_ops = bucket.downloaded_ops.max(expected);
                }
            }
        }
    }

    /// Operations received for the buckets covered by `priority`.
    pub fn operations_for_priority(&self, priority: BucketPriority) -> OperationCount {
        let relevant = self.buckets.iter().filter(|b| priority.covers(b.priority));
        relevant.fold(
            OperationCount {
                downloaded: 0,
                expected: Some(0),
            },
            |acc, b| OperationCount {
                downloaded: acc.downloaded + b.downloaded_ops,
                expected: acc.expected.zip(b.expected_ops).map(|(a, e)| a + e),
            },
        )
    }

    pub fn overall_operations(&self) -> OperationCount {
        self.operations_for_priority(BucketPriority::FULL_SYNC)
    }

    pub fn for_priority(&self, priority: BucketPriority) -> ProgressCount {
        let relevant = self.buckets.iter().filter(|b| priority.covers(b.priority));
        let (reached, total) = relevant.fold((0, 0), |(reached, total), b| {
            (reached + usize::from(b.reached), total + 1)
        });
        ProgressCount { reached, total }
    }

    pub fn overall(&self) -> ProgressCount {
        self.for_priority(BucketPriority::FULL_SYNC)
    }
}

/// Observable sync status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    pub downloading: bool,
    pub uploading: bool,
    /// Cleared on the next successful download.
    pub download_error: Option<String>,
    /// Cleared on the next successful upload.
    pub upload_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub has_synced: Option<bool>,
    pub priority_status: Vec<PriorityStatusEntry>,
    pub download_progress: Option<SyncDownloadProgress>,
}

impl SyncStatus {
    pub fn last_error(&self) -> Option<&str> {
        self.download_error
            .as_deref()
            .or(self.upload_error.as_deref())
    }

    /// Status for buckets at `priority`.
    ///
    /// A completed entry for priority `n` also covers every bucket with a
    /// smaller priority number, so the closest entry at or below `priority`
    /// in urgency answers the question. Without one, the full-sync values
    /// apply.
    pub fn status_for_priority(&self, priority: BucketPriority) -> PriorityStatusEntry {
        let mut entries: Vec<&PriorityStatusEntry> = self.priority_status.iter().collect();
        entries.sort_by_key(|e| e.priority);

        entries
            .into_iter()
            .find(|e| e.priority.covers(priority))
            .cloned()
            .unwrap_or(PriorityStatusEntry {
                priority,
                last_synced_at: self.last_synced_at,
                has_synced: self.has_synced,
            })
    }

    pub fn is_priority_synced(&self, priority: BucketPriority) -> bool {
        self.status_for_priority(priority).has_synced == Some(true)
    }

    /// Records a completed partial sync, replacing an older entry for the same priority.
    pub fn record_priority_synced(&mut self, priority: BucketPriority, at: DateTime<Utc>) {
        self.priority_status.retain(|e| e.priority != priority);
        self.priority_status.push(PriorityStatusEntry {
            priority,
            last_synced_at: Some(at),
            has_synced: Some(true),
        });
        if let Some(progress) = &mut self.download_progress {
            progress.mark_reached(priority);
        }
    }

    /// Records a completed full sync. Partial entries are superseded.
    pub fn record_full_sync(&mut self, at: DateTime<Utc>) {
        self.has_synced = Some(true);
        self.last_synced_at = Some(at);
        self.download_error = None;
        self.downloading = false;
        self.priority_status.clear();
        if let Some(progress) = &mut self.download_progress {
            progress.mark_reached(BucketPriority::FULL_SYNC);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BucketChecksum;

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            10,
            vec![
                BucketChecksum::new("urgent", 1u32).with_priority(0),
                BucketChecksum::new("normal", 2u32).with_priority(3),
                BucketChecksum::new("normal2", 3u32),
            ],
        )
    }

    #[test]
    fn progress_counts_buckets_by_priority() {
        let mut progress = SyncDownloadProgress::for_checkpoint(&checkpoint());
        assert_eq!(progress.overall(), ProgressCount { reached: 0, total: 3 });

        progress.mark_reached(BucketPriority(0));
        assert_eq!(
            progress.for_priority(BucketPriority(0)),
            ProgressCount { reached: 1, total: 1 }
        );
        assert!((progress.overall().fraction() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn data_lines_advance_operation_counts() {
        let checkpoint = Checkpoint::new(
            10,
            vec![
                BucketChecksum::new("a", 1u32).with_count(4),
                BucketChecksum::new("b", 2u32).with_count(6).with_priority(0),
            ],
        );
        let mut progress = SyncDownloadProgress::for_checkpoint(&checkpoint);
        assert_eq!(
            progress.overall_operations(),
            OperationCount { downloaded: 0, expected: Some(10) }
        );

        assert!(progress.record_data("a", 2));
        assert!(progress.record_data("b", 3));
        assert!(!progress.record_data("unknown", 7));
        assert_eq!(progress.overall_operations().downloaded, 5);
        assert_eq!(progress.overall_operations().fraction(), Some(0.5));
        assert_eq!(
            progress.operations_for_priority(BucketPriority(0)),
            OperationCount { downloaded: 3, expected: Some(6) }
        );

        progress.mark_reached(BucketPriority(0));
        assert_eq!(progress.operations_for_priority(BucketPriority(0)).fraction(), Some(1.0));
        assert_eq!(progress.overall_operations().downloaded, 8);
    }

    #[test]
    fn unknown_bucket_sizes_leave_the_fraction_open() {
        let mut progress = SyncDownloadProgress::for_checkpoint(&checkpoint());
        progress.record_data("urgent", 3);
        let ops = progress.overall_operations();
        assert_eq!(ops.downloaded, 3);
        assert_eq!(ops.fraction(), None);
    }

    #[test]
    fn a_new_target_keeps_operations_of_unfinished_buckets() {
        let mut previous = SyncDownloadProgress::for_checkpoint(&checkpoint());
        previous.record_data("urgent", 2);
        previous.record_data("normal", 5);
        previous.mark_reached(BucketPriority(0));

        let next = SyncDownloadProgress::for_checkpoint(&checkpoint()).continued_from(&previous);
        let downloaded: Vec<u64> = next.buckets.iter().map(|b| b.downloaded_ops).collect();
        assert_eq!(downloaded, vec![0, 5, 0]);
    }

    #[test]
    fn partial_sync_answers_higher_priorities_only() {
        let mut status = SyncStatus::default();
        status.record_priority_synced(BucketPriority(1), Utc::now());

        assert!(status.is_priority_synced(BucketPriority(0)));
        assert!(status.is_priority_synced(BucketPriority(1)));
        assert!(!status.is_priority_synced(BucketPriority(3)));

        status.record_full_sync(Utc::now());
        assert!(status.is_priority_synced(BucketPriority(3)));
        assert!(status.priority_status.is_empty());
    }

    #[test]
    fn last_error_prefers_download() {
        let status = SyncStatus {
            download_error: Some("down".into()),
            upload_error: Some("up".into()),
            ..Default::default()
        };
        assert_eq!(status.last_error(), Some("down"));
    }
}
