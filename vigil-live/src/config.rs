//! Service configuration.
//!
//! Loaded from a TOML file and/or `VIGIL_*` environment variables. Every
//! field has a default so an empty file (or no file) yields a working setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Message broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `mqtt://host:port` (port defaults to 1883)
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// First reconnect delay; doubles up to `reconnect_max_ms`
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
    /// Inbound message buffer between the broker and the pipeline
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Largest publish accepted from the broker (camera frames are big)
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    /// Also consume the deprecated merged `ai_alerts` topic
    #[serde(default)]
    pub legacy_alerts: bool,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "vigil-dashboard".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_inbound_capacity() -> usize {
    1024
}

fn default_max_packet_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            inbound_capacity: default_inbound_capacity(),
            max_packet_bytes: default_max_packet_bytes(),
            legacy_alerts: false,
        }
    }
}

impl BrokerConfig {
    /// Split the broker URL into host and port.
    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let rest = self
            .url
            .strip_prefix("mqtt://")
            .or_else(|| self.url.strip_prefix("tcp://"))
            .unwrap_or(&self.url);
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Invalid(format!("bad broker port in {}", self.url)))?;
                (host, port)
            }
            None => (rest, 1883),
        };
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("missing broker host in {}", self.url)));
        }
        Ok((host.to_string(), port))
    }
}

/// Real-time session gateway (WebSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-session outbound queue; the oldest events are dropped on overflow
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    /// Connections that have not finished the upgrade by then are dropped
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Close sessions silent for this long. Unbounded when absent.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_gateway_addr() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_max_sessions() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    256
}

fn default_heartbeat() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_gateway_addr(),
            max_sessions: default_max_sessions(),
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_secs: default_heartbeat(),
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: None,
        }
    }
}

/// HTTP API (alert history, user profiles, static uploads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_addr")]
    pub bind_addr: String,
    /// Limit applied to `GET /api/alerts` when the query has none
    #[serde(default)]
    pub default_alert_limit: Option<usize>,
}

fn default_http_addr() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_http_addr(),
            default_alert_limit: None,
        }
    }
}

/// Blob directories and the record database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// URL prefix the uploads directory is served under
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// fsync every record write
    #[serde(default = "default_true")]
    pub sync_writes: bool,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Unreferenced blobs younger than this are kept
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_public_prefix() -> String {
    "/uploads".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("vigil_data")
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_orphan_grace() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            public_prefix: default_public_prefix(),
            database_path: default_database_path(),
            sync_writes: true,
            sweep_interval_secs: default_sweep_interval(),
            orphan_grace_secs: default_orphan_grace(),
        }
    }
}

impl StorageConfig {
    /// Everything under one temporary root.
    pub fn for_testing(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            uploads_dir: root.join("uploads"),
            database_path: root.join("db"),
            sync_writes: false,
            ..Self::default()
        }
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

/// Upper bound on `pipeline.repository_retries`.
pub const MAX_REPOSITORY_RETRIES: u32 = 16;

/// Ingestion pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-topic worker queue
    #[serde(default = "default_topic_queue")]
    pub topic_queue_capacity: usize,
    /// Extra append attempts before an alert is dropped
    #[serde(default = "default_repository_retries")]
    pub repository_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub repository_retry_backoff_ms: u64,
}

fn default_topic_queue() -> usize {
    256
}

fn default_repository_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic_queue_capacity: default_topic_queue(),
            repository_retries: default_repository_retries(),
            repository_retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = AppConfig::default();
        config.apply_env();
        config
    }

    /// Load from file if it exists, otherwise from the environment.
    /// Environment variables override file values either way.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            _ => AppConfig::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `VIGIL_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Broker
        if let Some(url) = var("VIGIL_BROKER_URL") {
            self.broker.url = url;
        }
        if let Some(id) = var("VIGIL_BROKER_CLIENT_ID") {
            self.broker.client_id = id;
        }
        if let Some(user) = var("VIGIL_BROKER_USERNAME") {
            self.broker.username = Some(user);
        }
        if let Some(pass) = var("VIGIL_BROKER_PASSWORD") {
            self.broker.password = Some(pass);
        }
        if let Some(flag) = var("VIGIL_LEGACY_ALERTS") {
            self.broker.legacy_alerts = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        // Listeners
        if let Some(addr) = var("VIGIL_GATEWAY_ADDR") {
            self.gateway.bind_addr = addr;
        }
        if let Some(max) = var("VIGIL_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            self.gateway.max_sessions = max;
        }
        if let Some(addr) = var("VIGIL_HTTP_ADDR") {
            self.http.bind_addr = addr;
        }

        // Storage
        if let Some(dir) = var("VIGIL_UPLOADS_DIR") {
            self.storage.uploads_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("VIGIL_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.host_port()?;
        if self.broker.inbound_capacity == 0
            || self.gateway.queue_capacity == 0
            || self.pipeline.topic_queue_capacity == 0
        {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }
        if self.gateway.bind_addr == self.http.bind_addr {
            return Err(ConfigError::Invalid(format!(
                "gateway and http both bound to {}",
                self.http.bind_addr
            )));
        }
        if self.pipeline.repository_retries > MAX_REPOSITORY_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "repository_retries must be at most {MAX_REPOSITORY_RETRIES}"
            )));
        }
        if !self.storage.public_prefix.starts_with('/') {
            return Err(ConfigError::Invalid("public_prefix must start with '/'".into()));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.queue_capacity, 256);
        assert!(config.gateway.idle_timeout_secs.is_none());
        assert!(!config.broker.legacy_alerts);
        assert_eq!(config.storage.public_prefix, "/uploads");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [broker]
            url = "mqtt://dashboard-pi.local:1884"
            legacy_alerts = true

            [gateway]
            idle_timeout_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.host_port().unwrap(), ("dashboard-pi.local".to_string(), 1884));
        assert!(config.broker.legacy_alerts);
        assert_eq!(config.gateway.idle_timeout_secs, Some(120));
        assert_eq!(config.gateway.max_sessions, 256);
        assert_eq!(config.http.bind_addr, "0.0.0.0:5000");
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        assert!(matches!(AppConfig::from_toml("[broker"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_host_port_parsing() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.host_port().unwrap(), ("localhost".to_string(), 1883));

        broker.url = "10.0.0.5".into();
        assert_eq!(broker.host_port().unwrap(), ("10.0.0.5".to_string(), 1883));

        broker.url = "tcp://broker:9999/".into();
        assert_eq!(broker.host_port().unwrap(), ("broker".to_string(), 9999));

        broker.url = "mqtt://broker:notaport".into();
        assert!(broker.host_port().is_err());

        broker.url = "mqtt://:1883".into();
        assert!(broker.host_port().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VIGIL_BROKER_URL", "mqtt://edge:1883"),
            ("VIGIL_LEGACY_ALERTS", "true"),
            ("VIGIL_MAX_SESSIONS", "8"),
            ("VIGIL_UPLOADS_DIR", "/srv/uploads"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.broker.url, "mqtt://edge:1883");
        assert!(config.broker.legacy_alerts);
        assert_eq!(config.gateway.max_sessions, 8);
        assert_eq!(config.storage.uploads_dir, PathBuf::from("/srv/uploads"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = AppConfig::default();
        config.gateway.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.http.bind_addr = config.gateway.bind_addr.clone();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.public_prefix = "uploads".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.repository_retries = MAX_REPOSITORY_RETRIES + 1;
        assert!(config.validate().is_err());
        config.pipeline.repository_retries = MAX_REPOSITORY_RETRIES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_handshake_timeout_default_and_override() {
        assert_eq!(GatewayConfig::default().handshake_timeout_secs, 10);
        let config = AppConfig::from_toml("[gateway]\nhandshake_timeout_secs = 3\n").unwrap();
        assert_eq!(config.gateway.handshake_timeout_secs, 3);
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = AppConfig::load(Some("/nonexistent/vigil.toml")).unwrap();
        assert_eq!(config.pipeline.repository_retries, 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "[pipeline]\nrepository_retries = 5\n").unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.pipeline.repository_retries, 5);
    }

    #[test]
    fn test_from_env_starts_from_defaults() {
        // Pipeline settings have no environment overrides
        let config = AppConfig::from_env();
        assert_eq!(config.pipeline.topic_queue_capacity, 256);
        assert_eq!(config.storage.public_prefix, "/uploads");
    }

    #[test]
    fn test_example_config_parses() {
        let config = AppConfig::from_toml(include_str!("../../vigil.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateway.bind_addr, "0.0.0.0:5001");
        assert_eq!(config.storage.orphan_grace_secs, 600);
    }
}
