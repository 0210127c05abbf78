//! Fleetlink Configuration
//!
//! Configuration structures with serde defaults. Loaded from a YAML file
//! found on a small search path, or constructed with `Config::default()`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{FleetError, InfraError};

// ============================================================================
// Constants
// ============================================================================

/// Default session server bind host
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
/// Default session server port
pub const DEFAULT_SERVER_PORT: u16 = 7557;
/// Default WebSocket path
pub const DEFAULT_WS_PATH: &str = "/ws";
/// Default out-of-band wake port (also the discovery listener port)
pub const DEFAULT_WAKE_PORT: u16 = 7548;
/// Default liveness timeout: a device is online if seen within this window
pub const DEFAULT_ONLINE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
/// Default heartbeat interval advertised to devices (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
/// Default reconciliation page size
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default retention window for terminal task records (days)
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
/// Default delay between consecutive wake sends (milliseconds)
pub const DEFAULT_INTER_SEND_DELAY_MS: u64 = 50;
/// Default token lifetime (seconds)
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
/// Development-only signing secret; production deployments must override
pub const DEFAULT_AUTH_SECRET: &str = "fleetlink-dev-secret";

fn default_server_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}
fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_ws_path() -> String {
    DEFAULT_WS_PATH.to_string()
}
fn default_wake_port() -> u16 {
    DEFAULT_WAKE_PORT
}
fn default_online_timeout_ms() -> u64 {
    DEFAULT_ONLINE_TIMEOUT_MS
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}
fn default_inter_send_delay_ms() -> u64 {
    DEFAULT_INTER_SEND_DELAY_MS
}
fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}
fn default_auth_secret() -> String {
    DEFAULT_AUTH_SECRET.to_string()
}
fn default_acs_url() -> String {
    format!("ws://127.0.0.1:{}{}", DEFAULT_SERVER_PORT, DEFAULT_WS_PATH)
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token verification configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Liveness policy configuration
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Out-of-band wake channel configuration
    #[serde(default)]
    pub wake: WakeConfig,

    /// Reconciliation configuration
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            ws_path: default_ws_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC signing secret shared with the token issuer
    #[serde(default = "default_auth_secret")]
    pub secret: String,

    /// Lifetime of locally minted tokens (seconds)
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_auth_secret(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// A device whose last-seen timestamp is within this window is online
    #[serde(default = "default_online_timeout_ms")]
    pub online_timeout_ms: u64,

    /// Heartbeat interval advertised to devices (seconds)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub default_heartbeat_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_timeout_ms: default_online_timeout_ms(),
            default_heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    /// Default destination port for wake packets and local discovery listener
    #[serde(default = "default_wake_port")]
    pub port: u16,

    /// Controller address advertised in wake and discovery replies
    #[serde(default = "default_acs_url")]
    pub acs_url: String,

    /// Delay between consecutive sends in a batch (milliseconds)
    #[serde(default = "default_inter_send_delay_ms")]
    pub inter_send_delay_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            port: default_wake_port(),
            acs_url: default_acs_url(),
            inter_send_delay_ms: default_inter_send_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Page size for fleet-wide reconciliation runs
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Path of the sqlite task database; in-memory task store when unset
    #[serde(default)]
    pub task_db_path: Option<PathBuf>,

    /// Terminal task records older than this are eligible for cleanup (days)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            task_db_path: None,
            retention_days: default_retention_days(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path or the default search path
    pub fn load(path: &Option<String>) -> Result<Self, FleetError> {
        let candidates: Vec<Option<PathBuf>> = match path {
            Some(p) => vec![Some(PathBuf::from(p))],
            None => vec![
                Some(PathBuf::from("./fleetlink.yml")),
                dirs::home_dir().map(|h| h.join(".fleetlink/config.yml")),
                dirs::config_dir().map(|c| c.join("fleetlink.yml")),
            ],
        };

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                let content = std::fs::read_to_string(&candidate)?;
                let config: Config =
                    serde_yml::from_str(&content).map_err(InfraError::Yaml)?;
                tracing::debug!("Loaded configuration from {:?}", candidate);
                return Ok(config);
            }
        }

        // No file found: run on defaults
        tracing::debug!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &PathBuf) -> Result<(), FleetError> {
        let content = serde_yml::to_string(self).map_err(InfraError::Yaml)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A sample configuration with all defaults spelled out
    pub fn sample() -> Self {
        Config::default()
    }

    /// Online timeout as a chrono duration
    pub fn online_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.presence.online_timeout_ms as i64)
    }
}
