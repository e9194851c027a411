//! End-to-end sync against a mock sync service over real HTTP.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use basin_core::{Credentials, OpId};
use basin_db::{Column, CrudTransaction, Database, DatabaseOptions, InstanceRegistry, PoolConfig, Schema, SqlParam, Table};
use basin_sync::{BackendConnector, HttpTransport, SyncAgent, SyncConfig, SyncResult};

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Mock sync service
// =============================================================================

enum Reply {
    /// Body chunks, sent in order. The response then stays open.
    Chunks(Vec<String>),
    Status(StatusCode),
}

#[derive(Default)]
struct MockService {
    replies: Mutex<VecDeque<Reply>>,
    /// Body and `Authorization` header of every stream request.
    requests: Mutex<Vec<(Value, String)>>,
    checkpoint_client_ids: Mutex<Vec<String>>,
}

impl MockService {
    fn reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn requests(&self) -> Vec<(Value, String)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn stream_handler(
    State(service): State<Arc<MockService>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    service.requests.lock().unwrap().push((body, auth));

    let reply = service.replies.lock().unwrap().pop_front();
    let chunks = match reply {
        Some(Reply::Status(status)) => return status.into_response(),
        Some(Reply::Chunks(chunks)) => chunks,
        None => Vec::new(),
    };
    let body = stream::iter(chunks)
        .map(Ok::<_, Infallible>)
        .chain(stream::pending());
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body))
        .unwrap()
}

async fn write_checkpoint_handler(
    State(service): State<Arc<MockService>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    if let Some(id) = query.get("client_id") {
        service.checkpoint_client_ids.lock().unwrap().push(id.clone());
    }
    Json(json!({ "data": { "write_checkpoint": "7" } }))
}

async fn start_service() -> (Arc<MockService>, String) {
    let service = Arc::new(MockService::default());
    let app = Router::new()
        .route("/sync/stream", post(stream_handler))
        .route("/write-checkpoint2.json", get(write_checkpoint_handler))
        .with_state(service.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (service, format!("http://{addr}"))
}

// =============================================================================
// Test connector
// =============================================================================

struct Connector {
    endpoint: String,
    fetches: AtomicUsize,
    uploads: AtomicUsize,
}

impl Connector {
    fn new(endpoint: &str) -> Arc<Self> {
        Arc::new(Connector {
            endpoint: endpoint.to_string(),
            fetches: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BackendConnector for Connector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(Credentials::new(&self.endpoint, format!("token-{n}"))))
    }

    async fn upload_data(&self, _transaction: &CrudTransaction) -> SyncResult<Option<String>> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn open_db() -> Arc<Database> {
    let schema = Schema::new(vec![Table::new("users", vec![Column::text("name")])]);
    let options = DatabaseOptions::new(PoolConfig::in_memory(), schema);
    Arc::new(Database::open(options, &InstanceRegistry::new()).await.unwrap())
}

fn config() -> SyncConfig {
    SyncConfig::default()
        .with_retry_delay(Duration::from_millis(20))
        .with_crud_retry_delay(Duration::from_millis(20))
}

fn connect(db: &Arc<Database>, connector: Arc<Connector>) -> SyncAgent {
    SyncAgent::connect(
        db.clone(),
        connector,
        Arc::new(HttpTransport::new().unwrap()),
        config(),
    )
    .unwrap()
}

/// One checkpoint for `b1` carrying a single row, as ndjson.
fn b1_session(declared_checksum: u32) -> String {
    [
        json!({ "checkpoint": { "last_op_id": "10", "buckets": [{ "bucket": "b1", "checksum": declared_checksum }] } }),
        json!({ "data": { "bucket": "b1", "data": [{
            "op_id": "10", "op": "PUT", "object_type": "users", "object_id": "1",
            "data": "{\"name\":\"Ada\"}", "checksum": 42
        }] } }),
        json!({ "checkpoint_complete": { "last_op_id": "10" } }),
    ]
    .iter()
    .map(|line| format!("{line}\n"))
    .collect()
}

async fn user_name(db: &Database, id: &str) -> Option<String> {
    db.get_optional("SELECT name FROM users WHERE id = ?", vec![SqlParam::from(id)])
        .await
        .unwrap()
        .and_then(|row| row.get("name").and_then(|v| v.as_str()).map(String::from))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn fresh_client_applies_first_checkpoint() {
    let (service, endpoint) = start_service().await;
    // Line boundaries do not line up with chunk boundaries.
    let body = b1_session(42);
    let (head, tail) = body.split_at(body.len() / 2);
    service.reply(Reply::Chunks(vec![head.to_string(), tail.to_string()]));

    let db = open_db().await;
    let agent = connect(&db, Connector::new(&endpoint));

    tokio::time::timeout(WAIT, agent.wait_for_first_sync())
        .await
        .expect("first sync")
        .unwrap();

    assert_eq!(user_name(&db, "1").await.as_deref(), Some("Ada"));
    let states = db.bucket_storage().bucket_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].bucket, "b1");
    assert_eq!(states[0].op_id, OpId(10));

    let requests = service.requests();
    let (request, auth) = &requests[0];
    assert_eq!(auth, "Token token-1");
    assert_eq!(request["buckets"], json!([]));
    assert_eq!(request["include_checksum"], json!(true));

    agent.disconnect().await;
}

#[tokio::test]
async fn checksum_mismatch_downloads_the_bucket_again() {
    let (service, endpoint) = start_service().await;
    service.reply(Reply::Chunks(vec![b1_session(99)]));
    service.reply(Reply::Chunks(vec![b1_session(42)]));

    let db = open_db().await;
    let agent = connect(&db, Connector::new(&endpoint));

    tokio::time::timeout(WAIT, agent.wait_for_first_sync())
        .await
        .expect("first sync")
        .unwrap();

    let requests = service.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].0["buckets"], json!([{ "name": "b1", "after": "0" }]));
    assert_eq!(user_name(&db, "1").await.as_deref(), Some("Ada"));
    assert!(agent.current_status().download_error.is_none());

    agent.disconnect().await;
}

#[tokio::test]
async fn unauthorized_response_fetches_new_credentials() {
    let (service, endpoint) = start_service().await;
    service.reply(Reply::Status(StatusCode::UNAUTHORIZED));
    service.reply(Reply::Chunks(vec![b1_session(42)]));

    let db = open_db().await;
    let connector = Connector::new(&endpoint);
    let agent = connect(&db, connector.clone());

    tokio::time::timeout(WAIT, agent.wait_for_first_sync())
        .await
        .expect("first sync")
        .unwrap();

    let requests = service.requests();
    assert_eq!(requests[0].1, "Token token-1");
    assert_eq!(requests[1].1, "Token token-2");
    assert_eq!(connector.fetches.load(Ordering::SeqCst), 2);

    agent.disconnect().await;
}

#[tokio::test]
async fn uploaded_writes_wait_for_the_write_checkpoint() {
    let (service, endpoint) = start_service().await;

    let db = open_db().await;
    db.execute(
        "INSERT INTO users (id, name) VALUES (?, ?)",
        vec![SqlParam::from("u1"), SqlParam::from("local")],
    )
    .await
    .unwrap();

    let connector = Connector::new(&endpoint);
    let agent = connect(&db, connector.clone());

    tokio::time::timeout(WAIT, async {
        loop {
            let row = db
                .get_optional("SELECT target_op FROM ps_buckets WHERE name = '$local'", vec![])
                .await
                .unwrap();
            if row.and_then(|r| r.get("target_op").and_then(|v| v.as_i64())) == Some(7) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("local target");

    assert_eq!(connector.uploads.load(Ordering::SeqCst), 1);
    let client_id = db.crud().client_id().await.unwrap();
    assert_eq!(
        *service.checkpoint_client_ids.lock().unwrap(),
        vec![client_id]
    );
    // The local row stays visible until the service confirms it.
    assert_eq!(user_name(&db, "u1").await.as_deref(), Some("local"));

    agent.disconnect().await;
}
