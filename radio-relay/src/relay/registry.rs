use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::channel::{InboundChannel, close_code, close_reason};
use super::config::{LaunchSpec, SessionTimings};
use super::session::{RelayHandle, RelayStatus, SessionReport, run_session, spawn_transcoder};
use crate::collaborators::{AuditEventType, Collaborators, Notification, NotificationKind};
use crate::domain::BroadcastId;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

/// Relay lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Started {
        broadcast_id: BroadcastId,
        session_id: Uuid,
    },
    Ended {
        broadcast_id: BroadcastId,
        session_id: Uuid,
    },
    Failed {
        broadcast_id: BroadcastId,
        session_id: Uuid,
        reason: String,
    },
}

impl RelayEvent {
    pub fn broadcast_id(&self) -> &BroadcastId {
        match self {
            Self::Started { broadcast_id, .. }
            | Self::Ended { broadcast_id, .. }
            | Self::Failed { broadcast_id, .. } => broadcast_id,
        }
    }
}

/// Active relay sessions, at most one per broadcast.
pub struct RelayRegistry {
    sessions: DashMap<BroadcastId, Arc<RelayHandle>>,
    launch: LaunchSpec,
    timings: SessionTimings,
    collaborators: Collaborators,
    events: broadcast::Sender<RelayEvent>,
    transcoder_available: AtomicBool,
}

impl RelayRegistry {
    pub fn new(launch: LaunchSpec, timings: SessionTimings, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: DashMap::new(),
            launch,
            timings,
            collaborators,
            events,
            transcoder_available: AtomicBool::new(true),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Relay one broadcaster connection until it ends.
    ///
    /// Returns once the transcoder has been torn down and `channel` closed.
    /// A second session for a broadcast that is already live is refused
    /// with a policy-violation close.
    pub async fn run(&self, broadcast_id: BroadcastId, channel: &mut dyn InboundChannel) -> Result<SessionReport> {
        let handle = match self.sessions.entry(broadcast_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = Arc::new(RelayHandle::new(broadcast_id.clone()));
                slot.insert(handle.clone());
                Some(handle)
            }
        };

        let Some(handle) = handle else {
            warn!(%broadcast_id, "Refusing second relay session for live broadcast");
            channel
                .close(close_code::POLICY_VIOLATION, close_reason::SESSION_CONFLICT)
                .await;
            return Err(Error::SessionConflict(broadcast_id));
        };

        let lifecycle = Lifecycle::started(self, &handle);

        let child = match spawn_transcoder(&self.launch, &self.timings).await {
            Ok(child) => child,
            Err(e) => {
                error!(%broadcast_id, error = %e, "Transcoder unavailable");
                self.transcoder_available.store(false, Ordering::Release);
                self.remove(&handle);
                lifecycle.failed(self, e.to_string());
                channel
                    .close(close_code::INTERNAL_ERROR, close_reason::TRANSCODER_UNAVAILABLE)
                    .await;
                return Err(e);
            }
        };
        self.transcoder_available.store(true, Ordering::Release);

        let report = run_session(&handle, child, &self.launch, &self.timings, channel).await;
        self.remove(&handle);

        if report.end.is_failure() {
            lifecycle.failed(self, report.end.describe());
        } else {
            lifecycle.ended(self, &report);
        }
        Ok(report)
    }

    fn remove(&self, handle: &Arc<RelayHandle>) {
        self.sessions
            .remove_if(&handle.broadcast_id, |_, current| Arc::ptr_eq(current, handle));
    }

    /// Ask a live session to end. Returns false if none was running.
    pub fn stop(&self, broadcast_id: &BroadcastId) -> bool {
        match self.sessions.get(broadcast_id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().stop();
        }
    }

    pub fn get(&self, broadcast_id: &BroadcastId) -> Option<Arc<RelayHandle>> {
        self.sessions.get(broadcast_id).map(|h| h.value().clone())
    }

    pub fn is_active(&self, broadcast_id: &BroadcastId) -> bool {
        self.sessions.contains_key(broadcast_id)
    }

    pub fn is_any_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// The earliest-started live broadcast.
    pub fn current_broadcast_id(&self) -> Option<BroadcastId> {
        self.sessions
            .iter()
            .min_by_key(|entry| entry.value().started_at)
            .map(|entry| entry.key().clone())
    }

    pub fn relay_status(&self, broadcast_id: &BroadcastId) -> Option<RelayStatus> {
        self.sessions.get(broadcast_id).map(|h| h.status())
    }

    pub fn statuses(&self) -> Vec<RelayStatus> {
        let mut statuses: Vec<_> = self.sessions.iter().map(|h| h.status()).collect();
        statuses.sort_by_key(|s| s.started_at);
        statuses
    }

    /// Whether the last spawn attempt found a usable transcoder.
    pub fn is_transcoder_available(&self) -> bool {
        self.transcoder_available.load(Ordering::Acquire)
    }

    pub fn set_transcoder_available(&self, available: bool) {
        self.transcoder_available.store(available, Ordering::Release);
    }

    fn publish(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Reports one started and at most one terminal event per session.
///
/// The terminal methods consume the value, so a second report cannot be
/// written.
struct Lifecycle {
    broadcast_id: BroadcastId,
    session_id: Uuid,
}

impl Lifecycle {
    fn started(registry: &RelayRegistry, handle: &RelayHandle) -> Self {
        let broadcast_id = handle.broadcast_id.clone();
        let session_id = handle.session_id;
        info!(%broadcast_id, %session_id, "Relay session started");

        registry.collaborators.audit(
            AuditEventType::BroadcastStarted,
            format!("Live relay started for broadcast {}", broadcast_id),
            Some(&broadcast_id),
            json!({ "sessionId": session_id }),
        );
        registry.collaborators.notify(Notification::new(
            NotificationKind::BroadcastStarted,
            broadcast_id.clone(),
            "Broadcast is live",
        ));
        registry.publish(RelayEvent::Started {
            broadcast_id: broadcast_id.clone(),
            session_id,
        });

        Self {
            broadcast_id,
            session_id,
        }
    }

    fn ended(self, registry: &RelayRegistry, report: &SessionReport) {
        info!(
            broadcast_id = %self.broadcast_id,
            session_id = %self.session_id,
            bytes = report.bytes_relayed,
            "Relay session ended"
        );
        registry.collaborators.audit(
            AuditEventType::BroadcastEnded,
            format!("Live relay ended for broadcast {}: {}", self.broadcast_id, report.end.describe()),
            Some(&self.broadcast_id),
            json!({
                "sessionId": self.session_id,
                "bytesRelayed": report.bytes_relayed,
                "connected": report.connected,
            }),
        );
        registry.collaborators.notify(Notification::new(
            NotificationKind::BroadcastEnded,
            self.broadcast_id.clone(),
            "Broadcast ended",
        ));
        registry.publish(RelayEvent::Ended {
            broadcast_id: self.broadcast_id,
            session_id: self.session_id,
        });
    }

    fn failed(self, registry: &RelayRegistry, reason: String) {
        warn!(
            broadcast_id = %self.broadcast_id,
            session_id = %self.session_id,
            %reason,
            "Relay session failed"
        );
        registry.collaborators.audit(
            AuditEventType::BroadcastFailed,
            format!("Live relay failed for broadcast {}: {}", self.broadcast_id, reason),
            Some(&self.broadcast_id),
            json!({ "sessionId": self.session_id, "reason": reason }),
        );
        registry.collaborators.notify(Notification::new(
            NotificationKind::BroadcastFailed,
            self.broadcast_id.clone(),
            reason.clone(),
        ));
        registry.publish(RelayEvent::Failed {
            broadcast_id: self.broadcast_id,
            session_id: self.session_id,
            reason,
        });
    }
}
