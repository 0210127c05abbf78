// Out-of-band Wake Channel
//
// Best-effort UDP nudges to devices whose session is down. A wake packet
// asks the device to re-establish its WebSocket session; delivery is not
// guaranteed, no acknowledgement is expected, and a transport failure is
// reported as a boolean per target - never retried here.
//
// The companion `DiscoveryListener` answers local discovery probes with the
// controller address and logs inform/heartbeat datagrams. That path carries
// no registry state.

use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::time::sleep;

use crate::config::WakeConfig;
use crate::error::FleetError;
use crate::protocol::{OobPacket, WakeCommand};

/// One wake destination
#[derive(Debug, Clone)]
pub struct WakeTarget {
    pub ip: String,
    pub port: u16,
    pub cpe_id: Option<String>,
}

/// Sender side of the out-of-band channel
pub struct WakeChannel {
    acs_url: String,
    inter_send_delay: StdDuration,
}

impl WakeChannel {
    pub fn new(config: &WakeConfig) -> Self {
        Self {
            acs_url: config.acs_url.clone(),
            inter_send_delay: StdDuration::from_millis(config.inter_send_delay_ms),
        }
    }

    /// The packet a wake send carries
    pub fn wakeup_packet(&self, cpe_id: Option<String>) -> OobPacket {
        OobPacket::Wakeup {
            command: WakeCommand::ConnectToAcs,
            acs_url: self.acs_url.clone(),
            timestamp: Utc::now(),
            cpe_id,
        }
    }

    /// Send one wake packet. True iff the send call completed without a
    /// transport error; says nothing about delivery.
    pub async fn wake(&self, ip: &str, port: u16, packet: &OobPacket) -> bool {
        match self.send_datagram(ip, port, packet).await {
            Ok(()) => {
                tracing::debug!(ip = %ip, port = port, "Wake packet sent");
                true
            }
            Err(e) => {
                tracing::warn!(ip = %ip, port = port, error = %e, "Wake send failed");
                false
            }
        }
    }

    /// Sequential batch send with a fixed inter-send delay to avoid
    /// bursting the network. Returns the number of successful sends.
    pub async fn wake_many(&self, targets: &[WakeTarget]) -> usize {
        let mut sent = 0;
        for (i, target) in targets.iter().enumerate() {
            if i > 0 {
                sleep(self.inter_send_delay).await;
            }
            let packet = self.wakeup_packet(target.cpe_id.clone());
            if self.wake(&target.ip, target.port, &packet).await {
                sent += 1;
            }
        }
        sent
    }

    async fn send_datagram(
        &self,
        ip: &str,
        port: u16,
        packet: &OobPacket,
    ) -> Result<(), FleetError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let payload = serde_json::to_vec(packet)?;
        socket.send_to(&payload, (ip, port)).await?;
        Ok(())
    }
}

/// Inbound side of the out-of-band channel: answers `discovery` probes with
/// the controller address, logs everything else.
pub struct DiscoveryListener {
    socket: UdpSocket,
    acs_url: String,
}

impl DiscoveryListener {
    pub async fn bind(bind_host: &str, config: &WakeConfig) -> Result<Self, FleetError> {
        let socket = UdpSocket::bind((bind_host, config.port)).await?;
        tracing::info!(addr = %socket.local_addr()?, "Discovery listener bound");
        Ok(Self {
            socket,
            acs_url: config.acs_url.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, FleetError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) -> Result<(), FleetError> {
        let socket = self.socket;
        let mut buf = [0u8; 2048];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            match serde_json::from_slice::<OobPacket>(&buf[..len]) {
                Ok(OobPacket::Discovery { cpe_id }) => {
                    tracing::debug!(peer = %peer, cpe_id = ?cpe_id, "Discovery probe");
                    let reply = OobPacket::AcsLocation {
                        acs_url: self.acs_url.clone(),
                        timestamp: Utc::now(),
                    };
                    match serde_json::to_vec(&reply) {
                        Ok(payload) => {
                            if let Err(e) = socket.send_to(&payload, peer).await {
                                tracing::warn!(peer = %peer, error = %e, "Discovery reply failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Discovery reply encoding failed");
                        }
                    }
                }
                Ok(OobPacket::Inform { cpe_id, .. }) => {
                    tracing::debug!(peer = %peer, cpe_id = %cpe_id, "Inform packet");
                }
                Ok(OobPacket::Heartbeat { cpe_id }) => {
                    tracing::debug!(peer = %peer, cpe_id = %cpe_id, "UDP heartbeat");
                }
                Ok(other) => {
                    tracing::debug!(peer = %peer, packet = ?other, "Ignoring out-of-band packet");
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Unparseable out-of-band packet");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> WakeChannel {
        WakeChannel::new(&WakeConfig {
            port: 7548,
            acs_url: "ws://127.0.0.1:7557/ws".to_string(),
            inter_send_delay_ms: 1,
        })
    }

    #[tokio::test]
    async fn test_wake_delivers_parseable_packet() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let ch = channel();
        let packet = ch.wakeup_packet(Some("cpe-1".to_string()));
        assert!(ch.wake("127.0.0.1", port, &packet).await);

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let received: OobPacket = serde_json::from_slice(&buf[..len]).unwrap();
        match received {
            OobPacket::Wakeup {
                command,
                acs_url,
                cpe_id,
                ..
            } => {
                assert_eq!(command, WakeCommand::ConnectToAcs);
                assert_eq!(acs_url, "ws://127.0.0.1:7557/ws");
                assert_eq!(cpe_id.as_deref(), Some("cpe-1"));
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wake_unresolvable_target_is_false() {
        let ch = channel();
        let packet = ch.wakeup_packet(None);
        assert!(!ch.wake("definitely-not-a-host.invalid", 7548, &packet).await);
    }

    #[tokio::test]
    async fn test_wake_many_counts_successes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let ch = channel();
        let targets = vec![
            WakeTarget {
                ip: "127.0.0.1".to_string(),
                port,
                cpe_id: Some("cpe-1".to_string()),
            },
            WakeTarget {
                ip: "definitely-not-a-host.invalid".to_string(),
                port: 7548,
                cpe_id: Some("cpe-2".to_string()),
            },
            WakeTarget {
                ip: "127.0.0.1".to_string(),
                port,
                cpe_id: None,
            },
        ];
        assert_eq!(ch.wake_many(&targets).await, 2);
    }

    #[tokio::test]
    async fn test_discovery_listener_replies_with_acs_location() {
        let config = WakeConfig {
            port: 0, // ephemeral
            acs_url: "ws://controller:7557/ws".to_string(),
            inter_send_delay_ms: 1,
        };

        let listener = DiscoveryListener::bind("127.0.0.1", &config).await.unwrap();
        let listener_port = listener.local_addr().unwrap().port();
        tokio::spawn(listener.run());

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = serde_json::to_vec(&OobPacket::Discovery {
            cpe_id: Some("cpe-1".to_string()),
        })
        .unwrap();
        probe
            .send_to(&payload, ("127.0.0.1", listener_port))
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(
            StdDuration::from_secs(2),
            probe.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let reply: OobPacket = serde_json::from_slice(&buf[..len]).unwrap();
        assert!(matches!(
            reply,
            OobPacket::AcsLocation { acs_url, .. } if acs_url == "ws://controller:7557/ws"
        ));
    }
}
