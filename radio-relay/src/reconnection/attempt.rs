use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{BroadcastId, DisconnectionCategory};

/// Recovery bookkeeping for one broadcast.
///
/// Exists only while the broadcast is under recovery and is mutated only by
/// the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionAttempt {
    pub broadcast_id: BroadcastId,
    pub disconnection_category: DisconnectionCategory,
    pub attempt_count: u32,
    pub first_attempt_time: DateTime<Utc>,
    pub last_attempt_time: Option<DateTime<Utc>>,
}

impl ReconnectionAttempt {
    pub(crate) fn new(broadcast_id: BroadcastId, category: DisconnectionCategory) -> Self {
        Self {
            broadcast_id,
            disconnection_category: category,
            attempt_count: 0,
            first_attempt_time: Utc::now(),
            last_attempt_time: None,
        }
    }

    /// Start the next attempt and return its number.
    pub(crate) fn advance(&mut self) -> u32 {
        self.attempt_count += 1;
        self.last_attempt_time = Some(Utc::now());
        self.attempt_count
    }
}
