//! # Sync Configuration
//!
//! Configuration for the sync client and the `basin` binary.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BASIN_ENDPOINT=https://sync.example.com                            │
//! │     BASIN_RETRY_DELAY_MS=5000                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/basin/basin.toml (Linux)                                 │
//! │     ~/Library/Application Support/dev.basin.basin/basin.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # basin.toml
//! endpoint = "https://sync.example.com"
//! db_path = "/var/lib/app/basin.db"
//! retry_delay_ms = 5000
//! crud_retry_delay_ms = 5000
//! max_backoff_ms = 60000
//! token_refresh_margin_ms = 30000
//! watch_throttle_ms = 30
//! read_connections = 4
//! include_checksum = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

const CONFIG_FILE: &str = "basin.toml";

/// Sync client configuration. Durations are milliseconds on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sync service URL. Credentials from the connector take precedence.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// First reconnect delay; later ones grow up to `max_backoff`.
    #[serde(default = "default_retry_delay", rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,

    #[serde(default = "default_retry_delay", rename = "crud_retry_delay_ms", with = "millis")]
    pub crud_retry_delay: Duration,

    #[serde(default = "default_max_backoff", rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,

    /// Refresh credentials once the token has less than this left.
    #[serde(
        default = "default_token_refresh_margin",
        rename = "token_refresh_margin_ms",
        with = "millis"
    )]
    pub token_refresh_margin: Duration,

    #[serde(default = "default_watch_throttle", rename = "watch_throttle_ms", with = "millis")]
    pub watch_throttle: Duration,

    #[serde(default = "default_read_connections")]
    pub read_connections: u32,

    #[serde(default = "default_true")]
    pub include_checksum: bool,

    /// Passed to the service as sync rule parameters.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "basin", "basin")
        .map(|dirs| dirs.data_dir().join("basin.db"))
        .unwrap_or_else(|| PathBuf::from("basin.db"))
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_token_refresh_margin() -> Duration {
    Duration::from_secs(30)
}

fn default_watch_throttle() -> Duration {
    Duration::from_millis(30)
}

fn default_read_connections() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            endpoint: None,
            db_path: default_db_path(),
            retry_delay: default_retry_delay(),
            crud_retry_delay: default_retry_delay(),
            max_backoff: default_max_backoff(),
            token_refresh_margin: default_token_refresh_margin(),
            watch_throttle: default_watch_throttle(),
            read_connections: default_read_connections(),
            include_checksum: true,
            parameters: None,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`basin.toml`)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> SyncResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if let Some(endpoint) = &self.endpoint {
            let url = url::Url::parse(endpoint)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::Config(format!(
                    "endpoint must be http(s), got: {endpoint}"
                )));
            }
        }
        if self.retry_delay.is_zero() || self.crud_retry_delay.is_zero() {
            return Err(SyncError::Config("retry delays must be positive".into()));
        }
        if self.max_backoff < self.retry_delay {
            return Err(SyncError::Config(
                "max_backoff must not be shorter than retry_delay".into(),
            ));
        }
        Ok(())
    }

    /// Applies `BASIN_*` overrides read through `lookup`.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("BASIN_ENDPOINT") {
            debug!(endpoint = %endpoint, "Overriding endpoint from environment");
            self.endpoint = Some(endpoint);
        }
        if let Some(path) = lookup("BASIN_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }

        let millis = |key: &str| -> Option<Duration> {
            let raw = lookup(key)?;
            match raw.parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring non-numeric duration in environment");
                    None
                }
            }
        };
        if let Some(d) = millis("BASIN_RETRY_DELAY_MS") {
            self.retry_delay = d;
        }
        if let Some(d) = millis("BASIN_CRUD_RETRY_DELAY_MS") {
            self.crud_retry_delay = d;
        }
        if let Some(d) = millis("BASIN_MAX_BACKOFF_MS") {
            self.max_backoff = d;
        }
        if let Some(d) = millis("BASIN_THROTTLE_MS") {
            self.watch_throttle = d;
        }

        if let Some(raw) = lookup("BASIN_READ_CONNECTIONS") {
            match raw.parse() {
                Ok(n) => self.read_connections = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid BASIN_READ_CONNECTIONS"),
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "basin", "basin")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    // =========================================================================
    // Builder Methods
    // =========================================================================

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        if self.max_backoff < delay {
            self.max_backoff = delay;
        }
        self
    }

    pub fn with_crud_retry_delay(mut self, delay: Duration) -> Self {
        self.crud_retry_delay = delay;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_token_refresh_margin(mut self, margin: Duration) -> Self {
        self.token_refresh_margin = margin;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.crud_retry_delay, Duration::from_secs(5));
        assert_eq!(config.watch_throttle, Duration::from_millis(30));
        assert_eq!(config.read_connections, 4);
        assert!(config.include_checksum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let config = SyncConfig::from_toml(
            r#"
            endpoint = "https://sync.example.com"
            retry_delay_ms = 250
            max_backoff_ms = 10000
            include_checksum = false
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.as_deref(), Some("https://sync.example.com"));
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.max_backoff, Duration::from_secs(10));
        assert!(!config.include_checksum);
        // Untouched fields keep their defaults.
        assert_eq!(config.crud_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BASIN_ENDPOINT", "http://localhost:8080"),
            ("BASIN_CRUD_RETRY_DELAY_MS", "100"),
            ("BASIN_THROTTLE_MS", "nope"),
            ("BASIN_READ_CONNECTIONS", "2"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.crud_retry_delay, Duration::from_millis(100));
        assert_eq!(config.watch_throttle, Duration::from_millis(30));
        assert_eq!(config.read_connections, 2);
    }

    #[test]
    fn test_validation() {
        assert!(SyncConfig::default()
            .with_endpoint("ws://nope")
            .validate()
            .unwrap_err()
            .is_config_error());
        assert!(SyncConfig::default()
            .with_endpoint("not a url")
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_max_backoff(Duration::from_secs(1))
            .validate()
            .is_err());
    }
}
