// Connection Registry
//
// Holds the one live session per device id and routes outbound frames to it.
// The registry state is process-local and never persisted; a multi-instance
// deployment cannot route to a session held by a sibling process, so the
// contract lives behind the `SessionRouter` trait and callers take the trait
// object - a shared routing layer can replace `LocalRegistry` without
// touching them.
//
// At most one entry exists per device id. The last handshake wins: attaching
// a new session replaces the previous handle, dropping its sender, which
// ends the superseded session's writer loop. Detach is owner-checked so a
// superseded session tearing down cannot evict its replacement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// A live, writable session for one device
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl SessionHandle {
    pub fn new(remote_addr: String, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            remote_addr,
            connected_at: Utc::now(),
            sender,
        }
    }

    /// True iff the frame was handed to the session's writer
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Routing contract between callers and the live-connection state
#[async_trait]
pub trait SessionRouter: Send + Sync {
    /// Register a session, replacing any previous one for this device
    async fn attach(&self, cpe_id: &str, handle: SessionHandle);

    /// Remove the session, but only if `session_id` still owns the entry.
    /// Returns whether the entry was removed; a superseded session gets
    /// `false` and must not touch shared connection state.
    async fn detach(&self, cpe_id: &str, session_id: Uuid) -> bool;

    /// Push one frame to one device. True iff a live, writable session
    /// exists; callers fall back to queuing pending configuration otherwise.
    async fn send_to(&self, cpe_id: &str, message: ServerMessage) -> bool;

    /// Best-effort fan-out; returns how many sessions accepted the frame
    async fn broadcast(&self, message: ServerMessage) -> usize;

    /// Snapshot of connected device ids
    async fn connected(&self) -> Vec<String>;

    async fn is_connected(&self, cpe_id: &str) -> bool;

    async fn count(&self) -> usize;
}

/// Single-instance, in-process router
pub struct LocalRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRouter for LocalRegistry {
    async fn attach(&self, cpe_id: &str, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(cpe_id.to_string(), handle) {
            tracing::info!(
                cpe_id = %cpe_id,
                superseded = %previous.session_id,
                "Session replaced by a newer handshake"
            );
        }
    }

    async fn detach(&self, cpe_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(cpe_id)
            .map(|h| h.session_id == session_id)
            .unwrap_or(false)
        {
            sessions.remove(cpe_id);
            true
        } else {
            false
        }
    }

    async fn send_to(&self, cpe_id: &str, message: ServerMessage) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(cpe_id) {
            Some(handle) => handle.send(message),
            None => false,
        }
    }

    async fn broadcast(&self, message: ServerMessage) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|handle| handle.send(message.clone()))
            .count()
    }

    async fn connected(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn is_connected(&self, cpe_id: &str) -> bool {
        self.sessions.read().await.contains_key(cpe_id)
    }

    async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (SessionHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new("127.0.0.1:5000".to_string(), tx), rx)
    }

    #[tokio::test]
    async fn test_send_to_unknown_device_is_false() {
        let registry = LocalRegistry::new();
        assert!(!registry.send_to("cpe-1", ServerMessage::heartbeat_ack()).await);
    }

    #[tokio::test]
    async fn test_attach_send_detach() {
        let registry = LocalRegistry::new();
        let (h, mut rx) = handle();
        let sid = h.session_id;
        registry.attach("cpe-1", h).await;

        assert!(registry.is_connected("cpe-1").await);
        assert!(registry.send_to("cpe-1", ServerMessage::heartbeat_ack()).await);
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::HeartbeatAck { .. })
        ));

        assert!(registry.detach("cpe-1", sid).await);
        assert!(!registry.is_connected("cpe-1").await);
    }

    #[tokio::test]
    async fn test_last_handshake_wins() {
        let registry = LocalRegistry::new();
        let (old, _old_rx) = handle();
        let old_id = old.session_id;
        registry.attach("cpe-1", old).await;

        let (new, mut new_rx) = handle();
        registry.attach("cpe-1", new).await;

        // Frames route to the replacement
        assert!(registry.send_to("cpe-1", ServerMessage::heartbeat_ack()).await);
        assert!(new_rx.recv().await.is_some());

        // The superseded session's teardown must not evict the replacement
        assert!(!registry.detach("cpe-1", old_id).await);
        assert!(registry.is_connected("cpe-1").await);
    }

    #[tokio::test]
    async fn test_send_to_closed_session_is_false() {
        let registry = LocalRegistry::new();
        let (h, rx) = handle();
        registry.attach("cpe-1", h).await;
        drop(rx);
        assert!(!registry.send_to("cpe-1", ServerMessage::heartbeat_ack()).await);
    }

    #[tokio::test]
    async fn test_broadcast_counts_live_sessions() {
        let registry = LocalRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, rx2) = handle();
        registry.attach("cpe-1", h1).await;
        registry.attach("cpe-2", h2).await;
        drop(rx2);

        let delivered = registry
            .broadcast(ServerMessage::disconnect("shutdown"))
            .await;
        assert_eq!(delivered, 1);
    }
}
