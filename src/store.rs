// Device Store
//
// Device records and the read/bulk-write operations the core issues against
// the directory store. Directory CRUD beyond these operations (create, list,
// search) belongs to an external collaborator; this trait is the seam.
//
// Concurrency: all mutations to a given record are serialized at the store
// layer - the in-memory implementation holds one RwLock over the whole map,
// which gives per-record atomicity. There is no cross-operation lock:
// a reconciliation page's read and a concurrent heartbeat write to the same
// device may interleave (see reconcile.rs).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::FleetError;
use crate::presence::{presence, Presence};

/// Transport-level connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

/// One device in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub cpe_id: String,
    pub connection_status: ConnectionStatus,

    pub last_seen: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_count: u64,

    /// Cached liveness verdict; stale between heartbeats and runs
    pub online_status: Presence,
    pub online_status_updated_at: Option<DateTime<Utc>>,

    pub pending_config: Option<JsonValue>,
    pub current_config: Option<JsonValue>,

    pub ip_address: Option<String>,
    pub wakeup_port: Option<u16>,

    /// Times the server lost this device's session
    pub reconnect_attempts: u64,

    /// Free-form metrics merged from status frames
    pub metrics: Map<String, JsonValue>,
}

impl DeviceRecord {
    pub fn new(cpe_id: impl Into<String>, heartbeat_interval_secs: u64) -> Self {
        Self {
            cpe_id: cpe_id.into(),
            connection_status: ConnectionStatus::Disconnected,
            last_seen: None,
            last_heartbeat: None,
            heartbeat_interval_secs,
            heartbeat_count: 0,
            online_status: Presence::Offline,
            online_status_updated_at: None,
            pending_config: None,
            current_config: None,
            ip_address: None,
            wakeup_port: None,
            reconnect_attempts: 0,
            metrics: Map::new(),
        }
    }
}

/// The slim view reconciliation pages read: id, last-seen, cached verdict
#[derive(Debug, Clone)]
pub struct PresenceProjection {
    pub cpe_id: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub online_status: Presence,
}

/// Read/bulk-write surface the core issues against the directory store
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Fetch one record
    async fn get(&self, cpe_id: &str) -> Result<Option<DeviceRecord>, FleetError>;

    /// Create the record if absent, returning whether it was created
    async fn register(&self, cpe_id: &str, heartbeat_interval_secs: u64)
        -> Result<bool, FleetError>;

    /// Total number of devices
    async fn count(&self) -> Result<usize, FleetError>;

    /// One reconciliation page, ordered by `cpe_id` so pages cover the fleet
    /// in a strict index order
    async fn page(&self, offset: usize, limit: usize)
        -> Result<Vec<PresenceProjection>, FleetError>;

    /// Write the given presence verdicts. Unordered and best effort per
    /// record: unknown ids are skipped, not errors. Returns how many records
    /// were written.
    async fn bulk_set_presence(
        &self,
        updates: &[(String, Presence)],
    ) -> Result<usize, FleetError>;

    /// Heartbeat: bump last-seen/last-heartbeat/counter and refresh the
    /// cached verdict through the liveness calculator
    async fn record_heartbeat(&self, cpe_id: &str, timeout: Duration) -> Result<(), FleetError>;

    /// Merge reported metrics into device metadata and refresh last-seen
    async fn merge_status(
        &self,
        cpe_id: &str,
        metrics: Map<String, JsonValue>,
        configuration: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<(), FleetError>;

    /// Device acknowledged a pushed configuration: promote it to current,
    /// clear pending
    async fn apply_config_ack(
        &self,
        cpe_id: &str,
        configuration: JsonValue,
    ) -> Result<(), FleetError>;

    async fn set_connection_status(
        &self,
        cpe_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), FleetError>;

    /// Session closed: mark disconnected and bump the reconnect counter
    async fn mark_disconnected(&self, cpe_id: &str) -> Result<(), FleetError>;

    /// Queue a configuration for delivery on the device's next session
    async fn set_pending_config(
        &self,
        cpe_id: &str,
        configuration: JsonValue,
    ) -> Result<(), FleetError>;

    /// Record the peer address and wake port observed for a device
    async fn set_endpoint(
        &self,
        cpe_id: &str,
        ip_address: String,
        wakeup_port: Option<u16>,
    ) -> Result<(), FleetError>;

    /// Snapshot of all device ids
    async fn list_ids(&self) -> Result<Vec<String>, FleetError>;
}

/// In-memory device store
pub struct MemoryDeviceStore {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Test/seed helper: insert a fully formed record
    pub async fn insert(&self, record: DeviceRecord) {
        self.devices
            .write()
            .await
            .insert(record.cpe_id.clone(), record);
    }
}

impl Default for MemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, cpe_id: &str) -> Result<Option<DeviceRecord>, FleetError> {
        Ok(self.devices.read().await.get(cpe_id).cloned())
    }

    async fn register(
        &self,
        cpe_id: &str,
        heartbeat_interval_secs: u64,
    ) -> Result<bool, FleetError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(cpe_id) {
            return Ok(false);
        }
        devices.insert(
            cpe_id.to_string(),
            DeviceRecord::new(cpe_id, heartbeat_interval_secs),
        );
        Ok(true)
    }

    async fn count(&self) -> Result<usize, FleetError> {
        Ok(self.devices.read().await.len())
    }

    async fn page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PresenceProjection>, FleetError> {
        let devices = self.devices.read().await;
        let mut ids: Vec<&String> = devices.keys().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| devices.get(id))
            .map(|record| PresenceProjection {
                cpe_id: record.cpe_id.clone(),
                last_seen: record.last_seen,
                online_status: record.online_status,
            })
            .collect())
    }

    async fn bulk_set_presence(
        &self,
        updates: &[(String, Presence)],
    ) -> Result<usize, FleetError> {
        let mut devices = self.devices.write().await;
        let now = Utc::now();
        let mut written = 0;
        for (cpe_id, verdict) in updates {
            if let Some(record) = devices.get_mut(cpe_id) {
                record.online_status = *verdict;
                record.online_status_updated_at = Some(now);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn record_heartbeat(&self, cpe_id: &str, timeout: Duration) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            let now = Utc::now();
            record.last_heartbeat = Some(now);
            record.last_seen = Some(now);
            record.heartbeat_count += 1;
            record.online_status = presence(record.last_seen, now, timeout);
            record.online_status_updated_at = Some(now);
        }
        Ok(())
    }

    async fn merge_status(
        &self,
        cpe_id: &str,
        metrics: Map<String, JsonValue>,
        configuration: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            let now = Utc::now();
            for (key, value) in metrics {
                record.metrics.insert(key, value);
            }
            if let Some(config) = configuration {
                record.current_config = Some(config);
            }
            record.last_seen = Some(now);
            record.online_status = presence(record.last_seen, now, timeout);
            record.online_status_updated_at = Some(now);
        }
        Ok(())
    }

    async fn apply_config_ack(
        &self,
        cpe_id: &str,
        configuration: JsonValue,
    ) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            record.current_config = Some(configuration);
            record.pending_config = None;
        }
        Ok(())
    }

    async fn set_connection_status(
        &self,
        cpe_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            record.connection_status = status;
        }
        Ok(())
    }

    async fn mark_disconnected(&self, cpe_id: &str) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            record.connection_status = ConnectionStatus::Disconnected;
            record.reconnect_attempts += 1;
        }
        Ok(())
    }

    async fn set_pending_config(
        &self,
        cpe_id: &str,
        configuration: JsonValue,
    ) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            record.pending_config = Some(configuration);
        }
        Ok(())
    }

    async fn set_endpoint(
        &self,
        cpe_id: &str,
        ip_address: String,
        wakeup_port: Option<u16>,
    ) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(cpe_id) {
            record.ip_address = Some(ip_address);
            if wakeup_port.is_some() {
                record.wakeup_port = wakeup_port;
            }
        }
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, FleetError> {
        let devices = self.devices.read().await;
        let mut ids: Vec<String> = devices.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
