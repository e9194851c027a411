//! # basin
//!
//! Opens a local database and keeps it synced until Ctrl-C.
//!
//! ## Usage
//! ```bash
//! # Endpoint and token from the environment
//! BASIN_ENDPOINT=https://sync.example.com BASIN_TOKEN=... cargo run -p basin-sync --bin basin
//!
//! # Explicit config file, application tables from a JSON schema file
//! cargo run -p basin-sync --bin basin -- --config ./basin.toml --schema ./schema.json
//!
//! # Forward local writes to an application server
//! BASIN_UPLOAD_URL=https://api.example.com/crud cargo run -p basin-sync --bin basin
//! ```
//!
//! ## Environment
//! - `BASIN_TOKEN` - Sync service token (required to connect)
//! - `BASIN_UPLOAD_URL` - Receives `{"batch":[...]}` POSTs; without it
//!   uploads are logged and dropped
//! - `BASIN_*` - See `SyncConfig`
//! - `RUST_LOG` - Log filter

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use basin_core::Credentials;
use basin_db::{CrudTransaction, Database, DatabaseOptions, InstanceRegistry, PoolConfig, Schema};
use basin_sync::{BackendConnector, SyncAgentBuilder, SyncConfig, SyncError, SyncResult};

/// Connector driven entirely by environment variables.
struct EnvConnector {
    endpoint: Option<String>,
    token: Option<String>,
    upload_url: Option<String>,
    client: reqwest::Client,
}

#[async_trait]
impl BackendConnector for EnvConnector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| SyncError::Config("no endpoint configured (BASIN_ENDPOINT)".into()))?;
        Ok(self
            .token
            .as_ref()
            .map(|token| Credentials::new(endpoint, token.clone())))
    }

    async fn upload_data(&self, transaction: &CrudTransaction) -> SyncResult<Option<String>> {
        let Some(url) = &self.upload_url else {
            for entry in &transaction.crud {
                info!(%entry, "Dropping upload (BASIN_UPLOAD_URL not set)");
            }
            return Ok(None);
        };

        let batch: Vec<_> = transaction.crud.iter().map(|e| e.to_upload_json()).collect();
        let response = self
            .client
            .post(url)
            .json(&json!({ "batch": batch }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::Upload(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(None)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,basin=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_schema(path: Option<PathBuf>) -> Result<Schema, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => Ok(Schema::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    let mut config_path = None;
    let mut schema_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--schema" | "-s" => {
                if i + 1 < args.len() {
                    schema_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("basin - local-first sync client");
                println!();
                println!("Usage: basin [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Config file (default: platform config dir)");
                println!("  -s, --schema <PATH>  JSON schema of the application tables");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            other => warn!(arg = other, "Ignoring unknown argument"),
        }
        i += 1;
    }

    let config = SyncConfig::load(config_path)?;
    let schema = load_schema(schema_path)?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = PoolConfig::new(config.db_path.clone()).read_connections(config.read_connections);
    let options = DatabaseOptions::new(pool, schema).watch_throttle(config.watch_throttle);
    let db = Arc::new(Database::open(options, InstanceRegistry::global()).await?);
    info!(path = %config.db_path.display(), "Database opened");

    let connector = Arc::new(EnvConnector {
        endpoint: config.endpoint.clone(),
        token: env::var("BASIN_TOKEN").ok(),
        upload_url: env::var("BASIN_UPLOAD_URL").ok(),
        client: reqwest::Client::new(),
    });
    if connector.token.is_none() {
        warn!("BASIN_TOKEN not set; sync will report not signed in");
    }

    let agent = SyncAgentBuilder::new(config)
        .with_database(db.clone())
        .with_connector(connector)
        .connect()?;

    let mut status = agent.status();
    let mut last_state = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if last_state != Some(current.state) {
                    println!(
                        "{:?} (synced: {}, error: {})",
                        current.state,
                        current.has_synced == Some(true),
                        current.last_error().unwrap_or("-")
                    );
                    last_state = Some(current.state);
                }
            }
        }
    }

    info!("Shutting down");
    agent.disconnect().await;
    db.close().await;
    Ok(())
}
