//! # Replication Protocol Types
//!
//! Everything that travels over `POST /sync/stream`.
//!
//! ## Line Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Client                                   Service                       │
//! │    │                                         │                          │
//! │    │── StreamingSyncRequest {buckets} ──────►│                          │
//! │    │                                         │                          │
//! │    │◄── {"checkpoint": {...}} ───────────────│  target state            │
//! │    │◄── {"data": {"bucket": "b1", ...}} ─────│  oplog pages             │
//! │    │◄── {"checkpoint_complete": {...}} ──────│  apply now               │
//! │    │◄── {"token_expires_in": 280} ───────────│  keepalive               │
//! │    │◄── {"checkpoint_diff": {...}} ──────────│  patch the target        │
//! │    │              ...                        │                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each line is a JSON object with exactly one key. The key decides the
//! variant; anything else decodes to [`SyncLine::Unknown`] and is skipped so
//! newer services can add line types without breaking older clients.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// OpId
// =============================================================================

/// Position in a bucket's oplog.
///
/// The wire carries op ids as base-10 strings. Comparison is numeric, so
/// `"9" < "10"` holds here even though it fails lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OpId(pub i64);

impl OpId {
    /// Position before any operation. Buckets are requested "after 0" on first sync.
    pub const ZERO: OpId = OpId(0);
    pub const MAX: OpId = OpId(i64::MAX);

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OpId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        s.trim()
            .parse::<i64>()
            .map(OpId)
            .map_err(|_| CoreError::InvalidOpId(s.to_string()))
    }
}

impl From<i64> for OpId {
    fn from(value: i64) -> Self {
        OpId(value)
    }
}

impl Serialize for OpId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OpId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(OpId(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// Additive 32-bit bucket checksum.
///
/// A bucket's checksum is the sum of the checksums of every operation it
/// contains, modulo 2^32. The service sends them as signed or unsigned
/// integers depending on version, so decoding accepts both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum(pub u32);

impl Checksum {
    pub fn value(self) -> u32 {
        self.0
    }

    /// Signed representation, as stored in SQLite.
    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }

    /// Truncates any integer into the 32-bit checksum space.
    pub fn from_i64(value: i64) -> Self {
        Checksum(value as u32)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Checksum {
    fn from(value: u32) -> Self {
        Checksum(value)
    }
}

impl Add for Checksum {
    type Output = Checksum;

    fn add(self, rhs: Checksum) -> Checksum {
        Checksum(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Checksum {
    fn add_assign(&mut self, rhs: Checksum) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sum for Checksum {
    fn sum<I: Iterator<Item = Checksum>>(iter: I) -> Checksum {
        iter.fold(Checksum::default(), Add::add)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Signed(n) => Checksum::from_i64(n),
            Raw::Unsigned(n) => Checksum(n as u32),
        })
    }
}

// =============================================================================
// Buckets & Checkpoints
// =============================================================================

/// Bucket priority. Lower numbers sync first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketPriority(pub i32);

impl BucketPriority {
    /// Highest priority a bucket can declare.
    pub const HIGHEST: BucketPriority = BucketPriority(0);

    /// Sentinel for "all buckets", ranked below every declared priority.
    pub const FULL_SYNC: BucketPriority = BucketPriority(i32::MAX);

    /// Includes `other` when syncing up to `self`.
    pub fn covers(self, other: BucketPriority) -> bool {
        other.0 <= self.0
    }
}

impl Default for BucketPriority {
    fn default() -> Self {
        BucketPriority(3)
    }
}

impl fmt::Display for BucketPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-computed digest for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketChecksum {
    pub bucket: String,
    pub checksum: Checksum,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_op_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<BucketPriority>,
}

impl BucketChecksum {
    pub fn new(bucket: impl Into<String>, checksum: impl Into<Checksum>) -> Self {
        Self {
            bucket: bucket.into(),
            checksum: checksum.into(),
            count: None,
            last_op_id: None,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(BucketPriority(priority));
        self
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn priority(&self) -> BucketPriority {
        self.priority.unwrap_or_default()
    }
}

/// Target state declared by the service.
///
/// Immutable once received; a later `checkpoint` or `checkpoint_diff`
/// produces a new value instead of mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_op_id: OpId,
    #[serde(rename = "buckets", alias = "checksums")]
    pub checksums: Vec<BucketChecksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<String>,
}

impl Checkpoint {
    pub fn new(last_op_id: impl Into<OpId>, checksums: Vec<BucketChecksum>) -> Self {
        Self {
            last_op_id: last_op_id.into(),
            checksums,
            write_checkpoint: None,
        }
    }

    pub fn bucket(&self, name: &str) -> Option<&BucketChecksum> {
        self.checksums.iter().find(|c| c.bucket == name)
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.checksums.iter().map(|c| c.bucket.as_str())
    }

    /// Buckets included when syncing up to `priority`.
    pub fn buckets_up_to(&self, priority: BucketPriority) -> Vec<&BucketChecksum> {
        self.checksums
            .iter()
            .filter(|c| priority.covers(c.priority()))
            .collect()
    }

    /// Produces the checkpoint described by `diff` on top of this one.
    ///
    /// Bucket order is preserved for untouched and updated entries; new
    /// buckets are appended in the order the diff lists them.
    pub fn apply_diff(&self, diff: &CheckpointDiff) -> Checkpoint {
        let mut checksums: Vec<BucketChecksum> = self
            .checksums
            .iter()
            .filter(|c| !diff.removed_buckets.iter().any(|r| r == &c.bucket))
            .cloned()
            .collect();

        for updated in &diff.updated_buckets {
            match checksums.iter_mut().find(|c| c.bucket == updated.bucket) {
                Some(existing) => *existing = updated.clone(),
                None => checksums.push(updated.clone()),
            }
        }

        Checkpoint {
            last_op_id: diff.last_op_id,
            checksums,
            write_checkpoint: diff.write_checkpoint.clone(),
        }
    }
}

/// Incremental patch to the pending checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub last_op_id: OpId,
    #[serde(default)]
    pub updated_buckets: Vec<BucketChecksum>,
    #[serde(default)]
    pub removed_buckets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<String>,
}

/// Last applied position of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    pub bucket: String,
    pub op_id: OpId,
}

// =============================================================================
// Oplog
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Clear,
    Move,
    Put,
    Remove,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Clear => "CLEAR",
            OpType::Move => "MOVE",
            OpType::Put => "PUT",
            OpType::Remove => "REMOVE",
        }
    }
}

impl FromStr for OpType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "CLEAR" => Ok(OpType::Clear),
            "MOVE" => Ok(OpType::Move),
            "PUT" => Ok(OpType::Put),
            "REMOVE" => Ok(OpType::Remove),
            other => Err(CoreError::InvalidSyncLine(format!("unknown op type {other}"))),
        }
    }
}

/// One replicated change within a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_id: OpId,
    pub op: OpType,
    #[serde(rename = "object_type", alias = "row_type", default)]
    pub row_type: Option<String>,
    #[serde(rename = "object_id", alias = "row_id", default)]
    pub row_id: Option<String>,
    #[serde(default, deserialize_with = "json_text")]
    pub subkey: Option<String>,
    /// Row contents as JSON text.
    #[serde(default, deserialize_with = "json_text")]
    pub data: Option<String>,
    pub checksum: Checksum,
}

impl OplogEntry {
    pub fn put(
        op_id: i64,
        row_type: &str,
        row_id: &str,
        data: Value,
        checksum: u32,
    ) -> OplogEntry {
        OplogEntry {
            op_id: OpId(op_id),
            op: OpType::Put,
            row_type: Some(row_type.to_string()),
            row_id: Some(row_id.to_string()),
            subkey: None,
            data: Some(data.to_string()),
            checksum: Checksum(checksum),
        }
    }

    pub fn remove(op_id: i64, row_type: &str, row_id: &str, checksum: u32) -> OplogEntry {
        OplogEntry {
            op_id: OpId(op_id),
            op: OpType::Remove,
            row_type: Some(row_type.to_string()),
            row_id: Some(row_id.to_string()),
            subkey: None,
            data: None,
            checksum: Checksum(checksum),
        }
    }
}

/// Accepts JSON text or an inline JSON value, keeping it as text.
fn json_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// One page of oplog entries for a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDataBucket {
    pub bucket: String,
    pub data: Vec<OplogEntry>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_after: Option<OpId>,
}

// =============================================================================
// Sync Lines
// =============================================================================

/// One decoded line of the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncLine {
    Checkpoint(Checkpoint),
    CheckpointDiff(CheckpointDiff),
    CheckpointComplete {
        last_op_id: Option<OpId>,
    },
    PartialCheckpointComplete {
        last_op_id: Option<OpId>,
        priority: BucketPriority,
    },
    Data(SyncDataBucket),
    KeepAlive {
        token_expires_in: i64,
    },
    Unknown,
}

#[derive(Deserialize)]
struct CompleteBody {
    #[serde(default)]
    last_op_id: Option<OpId>,
    #[serde(default)]
    priority: Option<BucketPriority>,
}

impl SyncLine {
    /// Decodes one line by looking at which key the object carries.
    pub fn parse(line: &str) -> CoreResult<SyncLine> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| CoreError::InvalidSyncLine(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> CoreResult<SyncLine> {
        let Value::Object(map) = value else {
            return Err(CoreError::InvalidSyncLine(
                "expected a JSON object".to_string(),
            ));
        };
        if map.len() != 1 {
            return Ok(SyncLine::Unknown);
        }
        let Some((key, body)) = map.into_iter().next() else {
            return Ok(SyncLine::Unknown);
        };

        let line = match key.as_str() {
            "checkpoint" => SyncLine::Checkpoint(decode(&key, body)?),
            "checkpoint_diff" => SyncLine::CheckpointDiff(decode(&key, body)?),
            "checkpoint_complete" => {
                let body: CompleteBody = decode_complete(&key, body)?;
                SyncLine::CheckpointComplete {
                    last_op_id: body.last_op_id,
                }
            }
            "partial_checkpoint_complete" => {
                let body: CompleteBody = decode_complete(&key, body)?;
                let priority = body.priority.ok_or_else(|| {
                    CoreError::InvalidSyncLine(format!("{key}: missing priority"))
                })?;
                SyncLine::PartialCheckpointComplete {
                    last_op_id: body.last_op_id,
                    priority,
                }
            }
            "data" => SyncLine::Data(decode(&key, body)?),
            "token_expires_in" => SyncLine::KeepAlive {
                token_expires_in: body.as_i64().ok_or_else(|| {
                    CoreError::InvalidSyncLine(format!("{key}: expected an integer"))
                })?,
            },
            _ => SyncLine::Unknown,
        };
        Ok(line)
    }

    /// Encodes the line back into its wire shape. `Unknown` encodes as `{}`.
    pub fn to_value(&self) -> Value {
        match self {
            SyncLine::Checkpoint(c) => json!({ "checkpoint": c }),
            SyncLine::CheckpointDiff(d) => json!({ "checkpoint_diff": d }),
            SyncLine::CheckpointComplete { last_op_id } => {
                json!({ "checkpoint_complete": { "last_op_id": last_op_id } })
            }
            SyncLine::PartialCheckpointComplete {
                last_op_id,
                priority,
            } => json!({
                "partial_checkpoint_complete": { "last_op_id": last_op_id, "priority": priority }
            }),
            SyncLine::Data(d) => json!({ "data": d }),
            SyncLine::KeepAlive { token_expires_in } => {
                json!({ "token_expires_in": token_expires_in })
            }
            SyncLine::Unknown => json!({}),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, body: Value) -> CoreResult<T> {
    serde_json::from_value(body).map_err(|e| CoreError::InvalidSyncLine(format!("{key}: {e}")))
}

fn decode_complete(key: &str, body: Value) -> CoreResult<CompleteBody> {
    if body.is_null() {
        return Ok(CompleteBody {
            last_op_id: None,
            priority: None,
        });
    }
    decode(key, body)
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRequest {
    pub name: String,
    pub after: OpId,
}

/// Body of `POST /sync/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSyncRequest {
    pub buckets: Vec<BucketRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
    pub include_checksum: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl StreamingSyncRequest {
    pub fn from_states(states: &[BucketState], include_checksum: bool) -> Self {
        Self {
            buckets: states
                .iter()
                .map(|s| BucketRequest {
                    name: s.bucket.clone(),
                    after: s.op_id,
                })
                .collect(),
            only: None,
            include_checksum,
            client_id: None,
            parameters: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
