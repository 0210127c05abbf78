// Fleet Operations Facade
//
// The operation surface consumed by an external HTTP layer. Route handlers
// are not this crate's business; they take a `FleetOps` and call it. One
// explicitly constructed instance aggregates the session router, device
// store, wake channel and reconciler - there are no globals behind it.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{DomainError, FleetError};
use crate::protocol::ServerMessage;
use crate::reconcile::{Reconciler, ThrottleVerdict};
use crate::registry::SessionRouter;
use crate::store::DeviceStore;
use crate::tasks::{Task, TaskMode, TaskStats};
use crate::wake::{WakeChannel, WakeTarget};

/// How a configuration push was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed to a live session
    Delivered,
    /// No writable session; queued as pending configuration
    Queued,
}

pub struct FleetOps {
    config: Config,
    store: Arc<dyn DeviceStore>,
    router: Arc<dyn SessionRouter>,
    wake: Arc<WakeChannel>,
    reconciler: Arc<Reconciler>,
}

impl FleetOps {
    pub fn new(
        config: Config,
        store: Arc<dyn DeviceStore>,
        router: Arc<dyn SessionRouter>,
        wake: Arc<WakeChannel>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            store,
            router,
            wake,
            reconciler,
        }
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// True iff a live, writable session accepted the frame
    pub async fn send_to_cpe(&self, cpe_id: &str, message: ServerMessage) -> bool {
        self.router.send_to(cpe_id, message).await
    }

    /// Best-effort fan-out to every live session
    pub async fn broadcast(&self, message: ServerMessage) -> usize {
        self.router.broadcast(message).await
    }

    pub async fn connected_cpes(&self) -> Vec<String> {
        self.router.connected().await
    }

    /// Push a configuration, falling back to the pending queue when the
    /// device has no live session
    pub async fn push_configuration(
        &self,
        cpe_id: &str,
        configuration: JsonValue,
    ) -> Result<PushOutcome, FleetError> {
        if self.store.get(cpe_id).await?.is_none() {
            return Err(DomainError::DeviceNotFound {
                cpe_id: cpe_id.to_string(),
            }
            .into());
        }

        self.store
            .set_pending_config(cpe_id, configuration.clone())
            .await?;

        let message = ServerMessage::configuration_update(configuration);
        if self.router.send_to(cpe_id, message).await {
            Ok(PushOutcome::Delivered)
        } else {
            tracing::info!(cpe_id = %cpe_id, "No live session, configuration queued");
            Ok(PushOutcome::Queued)
        }
    }

    // ------------------------------------------------------------------
    // Wake operations
    // ------------------------------------------------------------------

    /// Wake a device by id using its last-known endpoint
    pub async fn wake_device(&self, cpe_id: &str) -> Result<bool, FleetError> {
        let record = self.store.get(cpe_id).await?.ok_or_else(|| {
            FleetError::from(DomainError::DeviceNotFound {
                cpe_id: cpe_id.to_string(),
            })
        })?;

        let Some(ip) = record.ip_address else {
            tracing::warn!(cpe_id = %cpe_id, "No known address for device, cannot wake");
            return Ok(false);
        };
        let port = record.wakeup_port.unwrap_or(self.config.wake.port);
        let packet = self.wake.wakeup_packet(Some(cpe_id.to_string()));
        Ok(self.wake.wake(&ip, port, &packet).await)
    }

    /// Raw wake to an explicit endpoint
    pub async fn wake(&self, ip: &str, port: u16, cpe_id: Option<String>) -> bool {
        let packet = self.wake.wakeup_packet(cpe_id);
        self.wake.wake(ip, port, &packet).await
    }

    /// Sequential batch wake; returns the success count
    pub async fn wake_many(&self, targets: &[WakeTarget]) -> usize {
        self.wake.wake_many(targets).await
    }

    // ------------------------------------------------------------------
    // Reconciliation operations
    // ------------------------------------------------------------------

    pub async fn start_run(&self, mode: TaskMode, operator: &str) -> Result<Task, FleetError> {
        self.reconciler.start_run(mode, operator).await
    }

    pub async fn check_throttle(&self) -> Result<ThrottleVerdict, FleetError> {
        self.reconciler.check_throttle(chrono::Utc::now()).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, FleetError> {
        self.reconciler.get_task(task_id).await
    }

    pub async fn latest_task(&self) -> Result<Option<Task>, FleetError> {
        self.reconciler.latest_task().await
    }

    pub async fn recent_tasks(&self, limit: usize) -> Result<Vec<Task>, FleetError> {
        self.reconciler.recent_tasks(limit).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, FleetError> {
        self.reconciler.cancel_task(task_id).await
    }

    pub async fn task_stats(&self) -> Result<TaskStats, FleetError> {
        self.reconciler.task_stats().await
    }

    pub async fn cleanup(&self, days_to_keep: i64) -> Result<usize, FleetError> {
        self.reconciler.cleanup(days_to_keep).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use crate::store::MemoryDeviceStore;
    use crate::tasks::{MemoryTaskStore, TaskStore};

    fn ops_with_store(store: Arc<MemoryDeviceStore>) -> FleetOps {
        let config = Config::default();
        let device_store: Arc<dyn DeviceStore> = store;
        let task_store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let router: Arc<dyn SessionRouter> = Arc::new(LocalRegistry::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&device_store),
            task_store,
            &config,
        ));
        let wake = Arc::new(WakeChannel::new(&config.wake));
        FleetOps::new(config, device_store, router, wake, reconciler)
    }

    #[tokio::test]
    async fn test_push_configuration_to_unknown_device() {
        let ops = ops_with_store(Arc::new(MemoryDeviceStore::new()));
        let err = ops
            .push_configuration("ghost", serde_json::json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::Domain(DomainError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_push_configuration_queues_without_session() {
        let store = Arc::new(MemoryDeviceStore::new());
        store.register("cpe-1", 60).await.unwrap();
        let ops = ops_with_store(Arc::clone(&store));

        let outcome = ops
            .push_configuration("cpe-1", serde_json::json!({"ssid": "field-7"}))
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Queued);

        let record = store.get("cpe-1").await.unwrap().unwrap();
        assert_eq!(
            record.pending_config,
            Some(serde_json::json!({"ssid": "field-7"}))
        );
    }

    #[tokio::test]
    async fn test_wake_device_unknown_is_not_found() {
        let ops = ops_with_store(Arc::new(MemoryDeviceStore::new()));
        let err = ops.wake_device("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::Domain(DomainError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wake_device_without_endpoint_is_false() {
        let store = Arc::new(MemoryDeviceStore::new());
        store.register("cpe-1", 60).await.unwrap();
        let ops = ops_with_store(store);
        assert!(!ops.wake_device("cpe-1").await.unwrap());
    }
}
