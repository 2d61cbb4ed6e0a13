use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::domain::{BroadcastId, DisconnectionCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconnectionStatus {
    Started,
    Attempting,
    Success,
    Failed,
}

/// A `RECONNECTION_STATUS` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "RECONNECTION_STATUS", rename_all = "camelCase")]
pub struct ReconnectionEvent {
    pub broadcast_id: BroadcastId,
    pub status: ReconnectionStatus,
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// Delay before the next attempt; absent on terminal events.
    pub next_delay_ms: Option<u64>,
    pub disconnection_type: DisconnectionCategory,
    pub timestamp: DateTime<Utc>,
}

impl ReconnectionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ReconnectionStatus::Success | ReconnectionStatus::Failed)
    }
}

/// Which reconnection events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Broadcast(BroadcastId),
    Global,
}

impl Topic {
    pub fn matches(&self, event: &ReconnectionEvent) -> bool {
        match self {
            Self::Broadcast(id) => event.broadcast_id == *id,
            Self::Global => true,
        }
    }
}

/// A broadcast receiver filtered to one [`Topic`].
pub struct TopicSubscription {
    topic: Topic,
    rx: broadcast::Receiver<ReconnectionEvent>,
}

impl TopicSubscription {
    pub(crate) fn new(topic: Topic, rx: broadcast::Receiver<ReconnectionEvent>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next matching event, or `None` once the coordinator is gone.
    ///
    /// A lagging subscriber skips what it missed.
    pub async fn recv(&mut self) -> Option<ReconnectionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topic.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Reconnection subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = ReconnectionEvent {
            broadcast_id: BroadcastId::from(42),
            status: ReconnectionStatus::Attempting,
            attempt_number: 2,
            max_attempts: 5,
            next_delay_ms: Some(4_000),
            disconnection_type: DisconnectionCategory::SourceDisconnected,
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "RECONNECTION_STATUS");
        assert_eq!(value["broadcastId"], "42");
        assert_eq!(value["status"], "ATTEMPTING");
        assert_eq!(value["attemptNumber"], 2);
        assert_eq!(value["maxAttempts"], 5);
        assert_eq!(value["nextDelayMs"], 4_000);
        assert_eq!(value["disconnectionType"], "SOURCE_DISCONNECTED");
        assert!(value["timestamp"].is_string());
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_topic_matching() {
        let event = ReconnectionEvent {
            broadcast_id: BroadcastId::from(1),
            status: ReconnectionStatus::Success,
            attempt_number: 1,
            max_attempts: 5,
            next_delay_ms: None,
            disconnection_type: DisconnectionCategory::NetworkIssue,
            timestamp: Utc::now(),
        };
        assert!(Topic::Global.matches(&event));
        assert!(Topic::Broadcast(BroadcastId::from(1)).matches(&event));
        assert!(!Topic::Broadcast(BroadcastId::from(2)).matches(&event));
        assert!(event.is_terminal());
    }
}
