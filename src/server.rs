// Device Session Server
//
// Accepts WebSocket sessions from devices, authenticates them, and runs one
// dispatch loop per session. The handshake URL carries `token` and `cpe_id`
// query parameters; the token's embedded device id must match the claimed
// one. Credential failures close the socket with a policy-violation code
// before any welcome frame; an internal fault while establishing a session
// closes that socket alone with an internal-error code.
//
// All outbound traffic for a session flows through its registry handle's
// channel, so the socket has a single writer. When a newer handshake for the
// same device replaces the registry entry, the old channel closes and the
// superseded loop winds down on its own.

use futures_util::{sink::SinkExt, stream::StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::error::FleetError;
use crate::protocol::{
    internal_error_close, parse_device_frame, policy_close, DeviceMessage, InboundFrame,
    ServerMessage,
};
use crate::registry::{SessionHandle, SessionRouter};
use crate::store::{ConnectionStatus, DeviceStore};

/// WebSocket endpoint for device sessions
pub struct SessionServer {
    config: Config,
    verifier: TokenVerifier,
    store: Arc<dyn DeviceStore>,
    router: Arc<dyn SessionRouter>,
}

impl SessionServer {
    pub fn new(config: Config, store: Arc<dyn DeviceStore>, router: Arc<dyn SessionRouter>) -> Self {
        let verifier = TokenVerifier::new(config.auth.secret.as_bytes().to_vec());
        Self {
            config,
            verifier,
            store,
            router,
        }
    }

    /// Bind the configured listen address. Split from `serve` so tests can
    /// bind an ephemeral port and read it back.
    pub async fn listen(&self) -> Result<TcpListener, FleetError> {
        let listener =
            TcpListener::bind((self.config.server.host.as_str(), self.config.server.port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "Session server listening");
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), FleetError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = handle_session(server, stream, peer).await {
                    tracing::error!(peer = %peer, error = %e, "Session error");
                }
            });
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), FleetError> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }
}

struct Credentials {
    token: String,
    cpe_id: String,
}

fn extract_credentials(uri: Option<&Uri>) -> Result<Credentials, String> {
    let query = uri
        .and_then(|u| u.query())
        .ok_or_else(|| "missing credentials".to_string())?;
    let params = parse_query(query);
    match (params.get("token"), params.get("cpe_id")) {
        (Some(token), Some(cpe_id)) if !token.is_empty() && !cpe_id.is_empty() => {
            Ok(Credentials {
                token: token.clone(),
                cpe_id: cpe_id.clone(),
            })
        }
        _ => Err("missing credentials".to_string()),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn handle_session(
    server: Arc<SessionServer>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), FleetError> {
    let mut request_uri: Option<Uri> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        request_uri = Some(req.uri().clone());
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split::<Message>();

    // Credential checks precede everything; no welcome is ever sent on a
    // policy close.
    let creds = match extract_credentials(request_uri.as_ref()) {
        Ok(creds) => creds,
        Err(reason) => {
            tracing::warn!(peer = %peer, reason = %reason, "Handshake rejected");
            let _ = ws_sender
                .send(Message::Close(Some(policy_close(reason))))
                .await;
            return Ok(());
        }
    };

    if let Err(e) = server.verifier.verify(&creds.token, &creds.cpe_id) {
        tracing::warn!(peer = %peer, cpe_id = %creds.cpe_id, error = %e, "Handshake rejected");
        let _ = ws_sender
            .send(Message::Close(Some(policy_close("policy violation"))))
            .await;
        return Ok(());
    }

    let cpe_id = creds.cpe_id;

    // Establish: persist connection state and register the live session.
    // Failures here abort this session only.
    let (session_id, mut rx) = match establish(&server, &cpe_id, peer).await {
        Ok(established) => established,
        Err(e) => {
            tracing::error!(peer = %peer, cpe_id = %cpe_id, error = %e, "Session establishment failed");
            let _ = ws_sender
                .send(Message::Close(Some(internal_error_close())))
                .await;
            return Err(e);
        }
    };

    tracing::info!(cpe_id = %cpe_id, peer = %peer, session = %session_id, "Device session established");
    let result = run_session(&server, &cpe_id, &mut ws_sender, &mut ws_receiver, &mut rx).await;

    // Teardown runs on every exit path. A superseded session no longer owns
    // the registry entry and must not mark the replacement's record
    // disconnected.
    if server.router.detach(&cpe_id, session_id).await {
        server.store.mark_disconnected(&cpe_id).await?;
    }
    tracing::info!(cpe_id = %cpe_id, session = %session_id, "Device session closed");
    result
}

async fn run_session<S, R>(
    server: &SessionServer,
    cpe_id: &str,
    ws_sender: &mut S,
    ws_receiver: &mut R,
    rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<(), FleetError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let welcome = ServerMessage::welcome("connected to fleetlink controller");
    ws_sender
        .send(Message::Text(serde_json::to_string(&welcome)?.into()))
        .await?;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        let is_disconnect = matches!(message, ServerMessage::Disconnect { .. });
                        let text = serde_json::to_string(&message)?;
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                        if is_disconnect {
                            break;
                        }
                    }
                    // Channel closed: this session was superseded
                    None => break,
                }
            }

            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        if msg.is_text() {
                            let text = msg.to_text()?;
                            dispatch_frame(server, cpe_id, text).await;
                        } else if msg.is_close() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(cpe_id = %cpe_id, error = %e, "Session transport error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

async fn establish(
    server: &SessionServer,
    cpe_id: &str,
    peer: SocketAddr,
) -> Result<(uuid::Uuid, mpsc::UnboundedReceiver<ServerMessage>), FleetError> {
    server
        .store
        .register(
            cpe_id,
            server.config.presence.default_heartbeat_interval_secs,
        )
        .await?;
    server
        .store
        .set_connection_status(cpe_id, ConnectionStatus::Connected)
        .await?;
    server
        .store
        .set_endpoint(cpe_id, peer.ip().to_string(), Some(server.config.wake.port))
        .await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle::new(peer.to_string(), tx);
    let session_id = handle.session_id;
    server.router.attach(cpe_id, handle).await;
    Ok((session_id, rx))
}

/// Apply one inbound frame. Protocol problems are logged and ignored; the
/// session stays open. Store faults are logged too - a failure handling one
/// frame must not take the session down.
async fn dispatch_frame(server: &SessionServer, cpe_id: &str, text: &str) {
    let timeout = server.config.online_timeout();
    match parse_device_frame(text) {
        InboundFrame::Message(DeviceMessage::Heartbeat { .. }) => {
            if let Err(e) = server.store.record_heartbeat(cpe_id, timeout).await {
                tracing::error!(cpe_id = %cpe_id, error = %e, "Heartbeat write failed");
                return;
            }
            // Exactly one ack per heartbeat
            if !server
                .router
                .send_to(cpe_id, ServerMessage::heartbeat_ack())
                .await
            {
                tracing::debug!(cpe_id = %cpe_id, "Heartbeat ack not deliverable");
            }
        }
        InboundFrame::Message(DeviceMessage::Status {
            metrics,
            configuration,
            ..
        }) => {
            if let Err(e) = server
                .store
                .merge_status(cpe_id, metrics, configuration, timeout)
                .await
            {
                tracing::error!(cpe_id = %cpe_id, error = %e, "Status merge failed");
            }
        }
        InboundFrame::Message(DeviceMessage::ConfigurationAck { configuration, .. }) => {
            if let Err(e) = server.store.apply_config_ack(cpe_id, configuration).await {
                tracing::error!(cpe_id = %cpe_id, error = %e, "Configuration ack failed");
            } else {
                tracing::info!(cpe_id = %cpe_id, "Configuration acknowledged");
            }
        }
        InboundFrame::Unknown { kind } => {
            tracing::warn!(cpe_id = %cpe_id, kind = %kind, "Unknown frame kind, ignoring");
        }
        InboundFrame::Malformed { reason } => {
            tracing::warn!(cpe_id = %cpe_id, reason = %reason, "Malformed frame, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let params = parse_query("token=abc.def&cpe_id=cpe-1");
        assert_eq!(params.get("token").map(String::as_str), Some("abc.def"));
        assert_eq!(params.get("cpe_id").map(String::as_str), Some("cpe-1"));
    }

    #[test]
    fn test_extract_credentials_requires_both() {
        let uri: Uri = "/ws?token=abc".parse().unwrap();
        assert!(extract_credentials(Some(&uri)).is_err());

        let uri: Uri = "/ws?cpe_id=cpe-1".parse().unwrap();
        assert!(extract_credentials(Some(&uri)).is_err());

        let uri: Uri = "/ws?token=abc&cpe_id=cpe-1".parse().unwrap();
        let creds = extract_credentials(Some(&uri)).unwrap();
        assert_eq!(creds.cpe_id, "cpe-1");

        assert!(extract_credentials(None).is_err());
    }
}
