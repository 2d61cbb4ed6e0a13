use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::BroadcastId;
use crate::status::CachedStatus;

/// The `STREAM_STATUS` message pushed to every listener.
///
/// Recomputed each cycle; never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "STREAM_STATUS", rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub is_live: bool,
    pub listener_count: u32,
    pub peak_listener_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<BroadcastId>,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Live only when a relay is running and upstream reports the mount live.
    pub fn compute(cached: &CachedStatus, current_broadcast: Option<BroadcastId>) -> Self {
        let is_live = current_broadcast.is_some() && cached.status.is_live;
        Self {
            is_live,
            listener_count: cached.status.listener_count,
            peak_listener_count: cached.status.peak_listener_count,
            broadcast_id: current_broadcast.filter(|_| is_live),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamStatus;

    fn cached(is_live: bool) -> CachedStatus {
        CachedStatus {
            status: UpstreamStatus {
                is_live,
                listener_count: 12,
                peak_listener_count: 30,
            },
            fetched_at: Some(Utc::now()),
            error: None,
        }
    }

    #[test]
    fn test_live_snapshot_wire_format() {
        let snapshot = StatusSnapshot::compute(&cached(true), Some(BroadcastId::from(42)));
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(value["type"], "STREAM_STATUS");
        assert_eq!(value["isLive"], true);
        assert_eq!(value["listenerCount"], 12);
        assert_eq!(value["peakListenerCount"], 30);
        assert_eq!(value["broadcastId"], "42");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_offline_when_no_relay() {
        let snapshot = StatusSnapshot::compute(&cached(true), None);
        assert!(!snapshot.is_live);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("broadcastId").is_none());
    }

    #[test]
    fn test_offline_when_upstream_not_live() {
        let snapshot = StatusSnapshot::compute(&cached(false), Some(BroadcastId::from(1)));
        assert!(!snapshot.is_live);
        assert_eq!(snapshot.broadcast_id, None);
    }
}
