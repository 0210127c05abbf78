// Liveness Policy
//
// Single source of truth for the online/offline verdict. Both the heartbeat
// path and the reconciliation orchestrator call `presence()`; the rule is
// never re-derived elsewhere. The cached `online_status` on a device record
// is exactly `presence(last_seen)` as of the moment it was written, and may
// be stale until the next heartbeat or reconciliation run.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Liveness verdict for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Compute the liveness verdict from a last-seen timestamp.
///
/// Online iff `now - last_seen <= timeout`; the boundary itself is online.
/// A device that was never seen is offline. Pure and deterministic: no I/O,
/// no hidden state.
pub fn presence(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> Presence {
    match last_seen {
        Some(seen) if now.signed_duration_since(seen) <= timeout => Presence::Online,
        _ => Presence::Offline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_seen_is_offline() {
        assert_eq!(
            presence(None, Utc::now(), Duration::minutes(30)),
            Presence::Offline
        );
    }

    #[test]
    fn test_boundary_is_online() {
        let now = Utc::now();
        let timeout = Duration::milliseconds(30 * 60 * 1000);
        let seen = now - timeout;
        assert_eq!(presence(Some(seen), now, timeout), Presence::Online);
    }

    #[test]
    fn test_one_ms_past_boundary_is_offline() {
        let now = Utc::now();
        let timeout = Duration::milliseconds(30 * 60 * 1000);
        let seen = now - timeout - Duration::milliseconds(1);
        assert_eq!(presence(Some(seen), now, timeout), Presence::Offline);
    }

    #[test]
    fn test_stale_device_recovers_after_heartbeat() {
        let timeout = Duration::milliseconds(30 * 60 * 1000);
        let now = Utc::now();

        // Seen 31 minutes ago: offline
        let seen = now - Duration::minutes(31);
        assert_eq!(presence(Some(seen), now, timeout), Presence::Offline);

        // A heartbeat lands: the verdict recomputes to online
        assert_eq!(presence(Some(now), now, timeout), Presence::Online);
    }

    #[test]
    fn test_deterministic() {
        let now = Utc::now();
        let seen = now - Duration::minutes(5);
        let timeout = Duration::minutes(30);
        let first = presence(Some(seen), now, timeout);
        for _ in 0..10 {
            assert_eq!(presence(Some(seen), now, timeout), first);
        }
    }

    #[test]
    fn test_future_last_seen_is_online() {
        // Clock skew: a device reporting slightly ahead of us is online
        let now = Utc::now();
        let seen = now + Duration::seconds(5);
        assert_eq!(presence(Some(seen), now, Duration::minutes(30)), Presence::Online);
    }
}
