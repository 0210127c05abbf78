// Fleetlink Wire Protocol
//
// This module implements the frame types for the two device-facing channels:
//
// 1. Session frames - JSON over the persistent WebSocket, one connection per
//    device. The server greets an authenticated device with `welcome`, then
//    exchanges heartbeat/status/configuration frames for the session lifetime.
// 2. Out-of-band packets - single JSON datagrams over UDP, used to ask an
//    unreachable device to re-establish its session (`wakeup`) and to answer
//    local `discovery` probes with the controller address.
//
// Close-code policy: credential failures close the socket with a policy
// violation; internal faults while establishing a session close it with an
// internal error. The two are distinguishable on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Frames pushed from the server to a device session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after a successful handshake
    Welcome {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Reply to each received heartbeat
    HeartbeatAck { timestamp: DateTime<Utc> },

    /// Push a configuration payload to the device
    ConfigurationUpdate {
        configuration: JsonValue,
        timestamp: DateTime<Utc>,
    },

    /// Server-initiated session termination notice
    Disconnect {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn welcome(message: impl Into<String>) -> Self {
        Self::Welcome {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self::HeartbeatAck {
            timestamp: Utc::now(),
        }
    }

    pub fn configuration_update(configuration: JsonValue) -> Self {
        Self::ConfigurationUpdate {
            configuration,
            timestamp: Utc::now(),
        }
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::Disconnect {
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Frames received from a device session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Periodic liveness signal
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Reported metrics and (optionally) the device's view of its config
    Status {
        #[serde(default)]
        metrics: Map<String, JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        configuration: Option<JsonValue>,
    },

    /// Device acknowledges a previously pushed configuration
    ConfigurationAck {
        configuration: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

/// Frame kinds the session dispatcher understands
pub const KNOWN_DEVICE_FRAMES: &[&str] = &["heartbeat", "status", "configuration_ack"];

/// Outcome of parsing one inbound session frame
#[derive(Debug)]
pub enum InboundFrame {
    /// A well-formed frame of a known kind
    Message(DeviceMessage),
    /// Valid JSON carrying an unrecognized `type`; logged and ignored
    Unknown { kind: String },
    /// Not valid JSON, not an object, or a known kind with a bad shape
    Malformed { reason: String },
}

/// Classify one inbound text frame.
///
/// Unknown kinds and malformed payloads are both non-fatal: the session
/// stays open either way, the caller only logs.
pub fn parse_device_frame(text: &str) -> InboundFrame {
    let value: JsonValue = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return InboundFrame::Malformed {
                reason: format!("invalid JSON: {}", e),
            }
        }
    };

    let kind = match value.get("type").and_then(JsonValue::as_str) {
        Some(k) => k.to_string(),
        None => {
            return InboundFrame::Malformed {
                reason: "missing frame type".to_string(),
            }
        }
    };

    if !KNOWN_DEVICE_FRAMES.contains(&kind.as_str()) {
        return InboundFrame::Unknown { kind };
    }

    match serde_json::from_value::<DeviceMessage>(value) {
        Ok(msg) => InboundFrame::Message(msg),
        Err(e) => InboundFrame::Malformed {
            reason: format!("bad {} frame: {}", kind, e),
        },
    }
}

/// Out-of-band packets exchanged over UDP.
///
/// Field names follow the on-wire casing devices expect (`acsUrl`, `cpeId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OobPacket {
    /// Ask a device to re-establish its session. Best effort, no reply.
    #[serde(rename_all = "camelCase")]
    Wakeup {
        command: WakeCommand,
        acs_url: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpe_id: Option<String>,
    },

    /// Unsolicited device announcement; carries no registry state
    #[serde(rename_all = "camelCase")]
    Inform {
        cpe_id: String,
        #[serde(default)]
        payload: JsonValue,
    },

    /// Device probing for the controller address
    #[serde(rename_all = "camelCase")]
    Discovery {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpe_id: Option<String>,
    },

    /// Low-rate liveness ping over UDP
    #[serde(rename_all = "camelCase")]
    Heartbeat { cpe_id: String },

    /// Reply to `discovery`
    #[serde(rename = "acsLocation", rename_all = "camelCase")]
    AcsLocation {
        acs_url: String,
        timestamp: DateTime<Utc>,
    },
}

/// The only wake command devices act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeCommand {
    #[serde(rename = "connectToACS")]
    ConnectToAcs,
}

/// Close frame for credential failures (bad/missing/mismatched token)
pub fn policy_close(reason: impl Into<String>) -> CloseFrame {
    CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into().into(),
    }
}

/// Close frame for internal faults while establishing a session
pub fn internal_error_close() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Error,
        reason: "internal error".into(),
    }
}
