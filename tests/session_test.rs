// Device Session End-to-End Tests
//
// Runs the real session server on an ephemeral port and drives it with a
// tokio-tungstenite client, covering the handshake auth gate, heartbeat
// acking, configuration round-trips and disconnect bookkeeping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use fleetlink::auth::TokenVerifier;
use fleetlink::config::Config;
use fleetlink::protocol::ServerMessage;
use fleetlink::registry::{LocalRegistry, SessionRouter};
use fleetlink::server::SessionServer;
use fleetlink::store::{ConnectionStatus, DeviceStore, MemoryDeviceStore};

struct Harness {
    addr: SocketAddr,
    store: Arc<MemoryDeviceStore>,
    router: Arc<LocalRegistry>,
    verifier: TokenVerifier,
}

impl Harness {
    fn url(&self, token: &str, cpe_id: &str) -> String {
        format!("ws://{}/ws?token={}&cpe_id={}", self.addr, token, cpe_id)
    }

    fn token_for(&self, cpe_id: &str) -> String {
        self.verifier
            .issue(cpe_id, chrono::Duration::hours(1))
            .unwrap()
    }
}

async fn start_server() -> Harness {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;

    let store = Arc::new(MemoryDeviceStore::new());
    let router = Arc::new(LocalRegistry::new());
    let server = Arc::new(SessionServer::new(
        config.clone(),
        Arc::clone(&store) as Arc<dyn DeviceStore>,
        Arc::clone(&router) as Arc<dyn SessionRouter>,
    ));
    let listener = server.listen().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    Harness {
        addr,
        store,
        router,
        verifier: TokenVerifier::new(config.auth.secret.as_bytes().to_vec()),
    }
}

fn parse_server_message(msg: &Message) -> ServerMessage {
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

async fn recv(
    ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Message {
    tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("transport error")
}

#[tokio::test]
async fn test_valid_handshake_gets_welcome() {
    let harness = start_server().await;
    let url = harness.url(&harness.token_for("cpe-1"), "cpe-1");

    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let first = recv(&mut ws).await;
    assert!(matches!(
        parse_server_message(&first),
        ServerMessage::Welcome { .. }
    ));

    // The record reflects the live connection
    let record = harness.store.get("cpe-1").await.unwrap().unwrap();
    assert_eq!(record.connection_status, ConnectionStatus::Connected);
    assert!(harness.router.is_connected("cpe-1").await);
}

#[tokio::test]
async fn test_invalid_token_closes_before_welcome() {
    let harness = start_server().await;
    let url = harness.url("not-a-real.token", "cpe-1");

    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let first = recv(&mut ws).await;
    match first {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected policy close, got {:?}", other),
    }
    assert!(!harness.router.is_connected("cpe-1").await);
}

#[tokio::test]
async fn test_token_for_other_device_is_policy_violation() {
    let harness = start_server().await;
    // Token minted for cpe-1, connection claims cpe-2
    let url = harness.url(&harness.token_for("cpe-1"), "cpe-2");

    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let first = recv(&mut ws).await;
    match first {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected policy close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let harness = start_server().await;
    let url = format!("ws://{}/ws", harness.addr);

    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let first = recv(&mut ws).await;
    assert!(matches!(first, Message::Close(Some(_))));
}

#[tokio::test]
async fn test_each_heartbeat_gets_exactly_one_ack() {
    let harness = start_server().await;
    let url = harness.url(&harness.token_for("cpe-1"), "cpe-1");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    recv(&mut ws).await; // welcome

    for expected_count in 1..=3u64 {
        ws.send(Message::Text(r#"{"type":"heartbeat"}"#.into()))
            .await
            .unwrap();
        let reply = recv(&mut ws).await;
        assert!(matches!(
            parse_server_message(&reply),
            ServerMessage::HeartbeatAck { .. }
        ));

        let record = harness.store.get("cpe-1").await.unwrap().unwrap();
        assert_eq!(record.heartbeat_count, expected_count);
        assert!(record.last_heartbeat.is_some());
    }

    // No stray frames beyond the three acks
    let extra = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(extra.is_err(), "unexpected extra frame: {:?}", extra);
}

#[tokio::test]
async fn test_unknown_frame_kind_keeps_session_open() {
    let harness = start_server().await;
    let url = harness.url(&harness.token_for("cpe-1"), "cpe-1");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    recv(&mut ws).await; // welcome

    ws.send(Message::Text(
        r#"{"type":"firmware_report","version":"9.9"}"#.into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text("definitely not json".into()))
        .await
        .unwrap();

    // Still alive: the next heartbeat is acked
    ws.send(Message::Text(r#"{"type":"heartbeat"}"#.into()))
        .await
        .unwrap();
    let reply = recv(&mut ws).await;
    assert!(matches!(
        parse_server_message(&reply),
        ServerMessage::HeartbeatAck { .. }
    ));
}

#[tokio::test]
async fn test_status_and_configuration_ack_update_record() {
    let harness = start_server().await;
    let url = harness.url(&harness.token_for("cpe-1"), "cpe-1");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    recv(&mut ws).await; // welcome

    ws.send(Message::Text(
        r#"{"type":"status","metrics":{"cpu":0.5,"rssi":-61}}"#.into(),
    ))
    .await
    .unwrap();

    // Push a configuration through the router, ack it from the device side
    assert!(
        harness
            .router
            .send_to(
                "cpe-1",
                ServerMessage::configuration_update(serde_json::json!({"ssid": "field-7"})),
            )
            .await
    );
    let pushed = recv(&mut ws).await;
    let configuration = match parse_server_message(&pushed) {
        ServerMessage::ConfigurationUpdate { configuration, .. } => configuration,
        other => panic!("expected configuration_update, got {:?}", other),
    };
    ws.send(Message::Text(
        serde_json::json!({"type": "configuration_ack", "configuration": configuration})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    // Wait for the server to apply both frames
    let mut record = None;
    for _ in 0..50 {
        let current = harness.store.get("cpe-1").await.unwrap().unwrap();
        if current.current_config.is_some() && !current.metrics.is_empty() {
            record = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = record.expect("record never updated");
    assert_eq!(record.metrics.get("cpu"), Some(&serde_json::json!(0.5)));
    assert_eq!(
        record.current_config,
        Some(serde_json::json!({"ssid": "field-7"}))
    );
    assert!(record.pending_config.is_none());
    assert!(record.last_seen.is_some());
}

#[tokio::test]
async fn test_close_marks_disconnected_and_counts_loss() {
    let harness = start_server().await;
    let url = harness.url(&harness.token_for("cpe-1"), "cpe-1");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    recv(&mut ws).await; // welcome

    ws.close(None).await.unwrap();

    let mut disconnected = None;
    for _ in 0..50 {
        let record = harness.store.get("cpe-1").await.unwrap().unwrap();
        if record.connection_status == ConnectionStatus::Disconnected {
            disconnected = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = disconnected.expect("never marked disconnected");
    assert_eq!(record.reconnect_attempts, 1);
    assert!(!harness.router.is_connected("cpe-1").await);
}

#[tokio::test]
async fn test_second_handshake_supersedes_first() {
    let harness = start_server().await;
    let token = harness.token_for("cpe-1");

    let (mut first, _) = tokio_tungstenite::connect_async(harness.url(&token, "cpe-1"))
        .await
        .unwrap();
    recv(&mut first).await; // welcome

    let (mut second, _) = tokio_tungstenite::connect_async(harness.url(&token, "cpe-1"))
        .await
        .unwrap();
    recv(&mut second).await; // welcome

    // Frames now route to the replacement session
    assert!(
        harness
            .router
            .send_to("cpe-1", ServerMessage::heartbeat_ack())
            .await
    );
    let frame = recv(&mut second).await;
    assert!(matches!(
        parse_server_message(&frame),
        ServerMessage::HeartbeatAck { .. }
    ));

    // The device stays attached after the superseded session winds down
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.router.is_connected("cpe-1").await);
}
