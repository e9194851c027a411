//! # CRUD Entries
//!
//! Local writes captured by the view triggers, waiting to be uploaded.
//!
//! Each row of the `ps_crud` log stores a JSON payload:
//!
//! ```text
//! {"op": "PUT" | "PATCH" | "DELETE", "type": "<table>", "id": "<row id>", "data": {...}}
//! ```
//!
//! `client_id` is the log's autoincrement key and defines delivery order.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateType {
    /// Insert or replace the whole row.
    Put,
    /// Update the listed columns.
    Patch,
    Delete,
}

/// One locally captured write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEntry {
    /// Row id.
    pub id: String,
    /// Position in the local CRUD log.
    pub client_id: i64,
    pub op: UpdateType,
    pub table: String,
    pub transaction_id: Option<i64>,
    pub op_data: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct StoredEntry {
    op: UpdateType,
    #[serde(rename = "type")]
    table: String,
    id: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

impl CrudEntry {
    /// Builds an entry from a `ps_crud` row.
    pub fn from_row(client_id: i64, transaction_id: Option<i64>, data: &str) -> CoreResult<Self> {
        let stored: StoredEntry =
            serde_json::from_str(data).map_err(|e| CoreError::InvalidCrudEntry {
                client_id,
                reason: e.to_string(),
            })?;

        Ok(CrudEntry {
            id: stored.id,
            client_id,
            op: stored.op,
            table: stored.table,
            transaction_id,
            op_data: stored.data,
        })
    }

    /// Wire shape used when forwarding the entry to an application server.
    pub fn to_upload_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("op".into(), serde_json::to_value(self.op).unwrap_or(Value::Null));
        body.insert("type".into(), Value::String(self.table.clone()));
        body.insert("id".into(), Value::String(self.id.clone()));
        if let Some(data) = &self.op_data {
            body.insert("data".into(), Value::Object(data.clone()));
        }
        Value::Object(body)
    }
}

impl fmt::Display for CrudEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CrudEntry<{}/{} {:?} {}/{}>",
            self.transaction_id.map_or("-".to_string(), |t| t.to_string()),
            self.client_id,
            self.op,
            self.table,
            self.id
        )
    }
}

/// Size of the local upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueueStats {
    pub count: i64,
    /// Payload bytes, when computed.
    pub size: Option<i64>,
}

impl fmt::Display for UploadQueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(size) => write!(f, "UploadQueueStats<count: {} size: {}kB>", self.count, size / 1024),
            None => write!(f, "UploadQueueStats<count: {}>", self.count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stored_payload() {
        let entry = CrudEntry::from_row(
            7,
            Some(3),
            r#"{"op":"PATCH","type":"users","id":"u1","data":{"name":"ada"}}"#,
        )
        .unwrap();

        assert_eq!(entry.client_id, 7);
        assert_eq!(entry.transaction_id, Some(3));
        assert_eq!(entry.op, UpdateType::Patch);
        assert_eq!(entry.table, "users");
        assert_eq!(entry.op_data.unwrap()["name"], json!("ada"));
    }

    #[test]
    fn delete_has_no_data() {
        let entry = CrudEntry::from_row(1, None, r#"{"op":"DELETE","type":"users","id":"u1"}"#).unwrap();
        assert!(entry.op_data.is_none());
        assert_eq!(
            entry.to_upload_json(),
            json!({"op": "DELETE", "type": "users", "id": "u1"})
        );
    }

    #[test]
    fn rejects_garbage() {
        let err = CrudEntry::from_row(9, None, "{}").unwrap_err();
        assert!(matches!(err, CoreError::InvalidCrudEntry { client_id: 9, .. }));
    }

    #[test]
    fn stats_display() {
        let stats = UploadQueueStats { count: 3, size: Some(4096) };
        assert_eq!(stats.to_string(), "UploadQueueStats<count: 3 size: 4kB>");
    }
}
