use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::attempt::ReconnectionAttempt;
use super::config::ReconnectionConfig;
use super::events::{ReconnectionEvent, ReconnectionStatus, Topic, TopicSubscription};
use crate::collaborators::{AuditEventType, Collaborators, Notification, NotificationKind};
use crate::domain::{BroadcastId, DisconnectionCategory};
use crate::resilience::{CircuitBreaker, Guarded};
use crate::scheduler::{Scheduler, millis};
use crate::upstream::SourceProbe;

const EVENT_CAPACITY: usize = 256;

struct ActiveRecovery {
    attempt: ReconnectionAttempt,
    token: CancellationToken,
    /// Distinguishes this recovery from a later one for the same broadcast.
    generation: u64,
    started: Instant,
}

/// Drives per-broadcast recovery state machines.
///
/// Every event for a recovery is published while its map entry is locked
/// and only if the entry still belongs to that recovery, so nothing is
/// published for a broadcast after [`cancel`](Self::cancel) returns.
pub struct ReconnectionCoordinator {
    config: ReconnectionConfig,
    probe: Arc<dyn SourceProbe>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Scheduler,
    collaborators: Collaborators,
    active: DashMap<BroadcastId, ActiveRecovery>,
    events: broadcast::Sender<ReconnectionEvent>,
    next_generation: AtomicU64,
}

impl ReconnectionCoordinator {
    pub fn new(
        config: ReconnectionConfig,
        probe: Arc<dyn SourceProbe>,
        breaker: Arc<CircuitBreaker>,
        scheduler: Scheduler,
        collaborators: Collaborators,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            probe,
            breaker,
            scheduler,
            collaborators,
            active: DashMap::new(),
            events,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_topic(&self, topic: Topic) -> TopicSubscription {
        TopicSubscription::new(topic, self.events.subscribe())
    }

    /// Begin recovery for a broadcast.
    ///
    /// Returns `false` without side effects if recovery is disabled, the
    /// category is not automatically recoverable, or a recovery is already
    /// active for this broadcast.
    pub fn trigger(self: &Arc<Self>, broadcast_id: BroadcastId, category: DisconnectionCategory) -> bool {
        if !self.config.enabled {
            debug!(%broadcast_id, "Automatic reconnection disabled");
            return false;
        }
        if !category.supports_automatic_recovery() {
            debug!(%broadcast_id, %category, "Category does not support automatic recovery");
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        match self.active.entry(broadcast_id.clone()) {
            Entry::Occupied(_) => {
                debug!(%broadcast_id, "Reconnection already in progress");
                return false;
            }
            Entry::Vacant(slot) => {
                let active = slot.insert(ActiveRecovery {
                    attempt: ReconnectionAttempt::new(broadcast_id.clone(), category),
                    token: token.clone(),
                    generation,
                    started: Instant::now(),
                });
                info!(
                    %broadcast_id,
                    %category,
                    max_attempts = self.config.max_attempts,
                    "Starting automatic reconnection"
                );
                self.publish(&*active, ReconnectionStatus::Started, Some(self.config.delay_for_attempt(1)));
            }
        }

        let coordinator = self.clone();
        self.scheduler
            .spawn(async move { coordinator.run(broadcast_id, generation, token).await });
        true
    }

    /// Stop any recovery for `broadcast_id` and forget it.
    ///
    /// Returns whether a recovery was active.
    pub fn cancel(&self, broadcast_id: &BroadcastId) -> bool {
        match self.active.remove(broadcast_id) {
            Some((_, active)) => {
                active.token.cancel();
                info!(
                    %broadcast_id,
                    attempts = active.attempt.attempt_count,
                    "Reconnection cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Cancel every active recovery.
    pub fn shutdown(&self) {
        let ids: Vec<BroadcastId> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    pub fn is_reconnecting(&self, broadcast_id: &BroadcastId) -> bool {
        self.active.contains_key(broadcast_id)
    }

    pub fn attempt(&self, broadcast_id: &BroadcastId) -> Option<ReconnectionAttempt> {
        self.active.get(broadcast_id).map(|a| a.attempt.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn run(self: Arc<Self>, broadcast_id: BroadcastId, generation: u64, token: CancellationToken) {
        loop {
            let Some(attempt) = self.advance(&broadcast_id, generation) else {
                return;
            };

            let delay = self.config.delay_for_attempt(attempt);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let next_delay = self.config.delay_for_attempt(attempt + 1);
            let emitted = self.with_current(&broadcast_id, generation, |active| {
                self.publish(active, ReconnectionStatus::Attempting, Some(next_delay));
            });
            if emitted.is_none() {
                return;
            }
            debug!(%broadcast_id, attempt, "Probing source health");

            let restored = tokio::select! {
                _ = token.cancelled() => return,
                restored = self.probe_restored(&broadcast_id) => restored,
            };

            if restored {
                self.finish(&broadcast_id, generation, ReconnectionStatus::Success);
                return;
            }
            if attempt >= self.config.max_attempts {
                self.finish(&broadcast_id, generation, ReconnectionStatus::Failed);
                return;
            }
        }
    }

    /// Increment the attempt counter if the recovery is still current.
    fn advance(&self, broadcast_id: &BroadcastId, generation: u64) -> Option<u32> {
        let mut active = self.active.get_mut(broadcast_id)?;
        if active.generation != generation {
            return None;
        }
        Some(active.attempt.advance())
    }

    fn with_current<R>(
        &self,
        broadcast_id: &BroadcastId,
        generation: u64,
        f: impl FnOnce(&ActiveRecovery) -> R,
    ) -> Option<R> {
        let active = self.active.get(broadcast_id)?;
        (active.generation == generation).then(|| f(&*active))
    }

    async fn probe_restored(&self, broadcast_id: &BroadcastId) -> bool {
        match self.breaker.call(self.probe.probe(broadcast_id)).await {
            Guarded::Completed(probe) => probe.is_source_restored(),
            Guarded::Blocked => {
                debug!(%broadcast_id, "Circuit open, counting attempt as not restored");
                false
            }
            Guarded::Failed(e) => {
                debug!(%broadcast_id, error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Clear state and publish the terminal event in one step.
    fn finish(&self, broadcast_id: &BroadcastId, generation: u64, status: ReconnectionStatus) {
        let mut finished = None;
        self.active.remove_if(broadcast_id, |_, active| {
            if active.generation != generation {
                return false;
            }
            self.publish(active, status, None);
            finished = Some((active.attempt.clone(), active.started.elapsed()));
            true
        });

        let Some((attempt, elapsed)) = finished else {
            return;
        };
        let elapsed_ms = millis(elapsed);
        let metadata = json!({
            "attempts": attempt.attempt_count,
            "elapsedMs": elapsed_ms,
            "disconnectionType": attempt.disconnection_category.as_str(),
        });

        match status {
            ReconnectionStatus::Success => {
                info!(
                    %broadcast_id,
                    attempts = attempt.attempt_count,
                    elapsed_ms,
                    "Broadcast recovered"
                );
                self.collaborators.audit(
                    AuditEventType::BroadcastRecovery,
                    format!(
                        "Broadcast {} recovered after {} attempt(s)",
                        broadcast_id, attempt.attempt_count
                    ),
                    Some(broadcast_id),
                    metadata,
                );
                self.collaborators.notify(Notification::new(
                    NotificationKind::RecoverySucceeded,
                    broadcast_id.clone(),
                    "Your broadcast source is back",
                ));
            }
            _ => {
                error!(
                    %broadcast_id,
                    attempts = attempt.attempt_count,
                    elapsed_ms,
                    "Automatic reconnection exhausted, manual intervention required"
                );
                self.collaborators.audit(
                    AuditEventType::BroadcastRecoveryFailed,
                    format!(
                        "Broadcast {} not recovered after {} attempt(s); manual intervention required",
                        broadcast_id, attempt.attempt_count
                    ),
                    Some(broadcast_id),
                    metadata,
                );
                self.collaborators.notify(Notification::new(
                    NotificationKind::RecoveryFailed,
                    broadcast_id.clone(),
                    "Automatic reconnection failed; please reconnect your source",
                ));
            }
        }
    }

    fn publish(&self, active: &ActiveRecovery, status: ReconnectionStatus, next_delay: Option<std::time::Duration>) {
        let event = ReconnectionEvent {
            broadcast_id: active.attempt.broadcast_id.clone(),
            status,
            attempt_number: active.attempt.attempt_count,
            max_attempts: self.config.max_attempts,
            next_delay_ms: next_delay.map(millis),
            disconnection_type: active.attempt.disconnection_category,
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::RecordingAudit;
    use crate::health::HealthProbe;
    use crate::resilience::CircuitBreakerConfig;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Replays scripted probe outcomes; once exhausted, keeps reporting no source.
    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<Result<HealthProbe>>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<Result<HealthProbe>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SourceProbe for ScriptedProbe {
        async fn probe(&self, _broadcast_id: &BroadcastId) -> Result<HealthProbe> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().pop_front().unwrap_or_else(|| Ok(source_gone()))
        }
    }

    fn source_gone() -> HealthProbe {
        HealthProbe {
            server_reachable: true,
            mount_point_exists: true,
            ..Default::default()
        }
    }

    fn source_back() -> HealthProbe {
        HealthProbe {
            server_reachable: true,
            mount_point_exists: true,
            has_active_source: true,
            bitrate: 128,
            within_grace_period: false,
        }
    }

    fn coordinator_with(
        config: ReconnectionConfig,
        probe: Arc<ScriptedProbe>,
        breaker: CircuitBreakerConfig,
        audit: Arc<RecordingAudit>,
    ) -> Arc<ReconnectionCoordinator> {
        let collaborators = Collaborators::noop().with_audit(audit);
        Arc::new(ReconnectionCoordinator::new(
            config,
            probe,
            Arc::new(CircuitBreaker::new("icecast", breaker, collaborators.clone())),
            Scheduler::current(),
            collaborators,
        ))
    }

    fn coordinator(probe: Arc<ScriptedProbe>) -> Arc<ReconnectionCoordinator> {
        coordinator_with(
            ReconnectionConfig::default(),
            probe,
            CircuitBreakerConfig::default(),
            Arc::new(RecordingAudit::default()),
        )
    }

    async fn collect_until_terminal(
        rx: &mut broadcast::Receiver<ReconnectionEvent>,
    ) -> Vec<(ReconnectionEvent, Duration)> {
        let start = Instant::now();
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let terminal = event.is_terminal();
            seen.push((event, start.elapsed()));
            if terminal {
                return seen;
            }
        }
    }

    fn assert_near(elapsed: Duration, expected_ms: u64) {
        let ms = elapsed.as_millis() as u64;
        assert!(
            ms >= expected_ms && ms < expected_ms + 10,
            "expected ~{}ms, got {}ms",
            expected_ms,
            ms
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_two_failed_probes() {
        let probe = ScriptedProbe::new(vec![Ok(source_gone()), Ok(source_gone()), Ok(source_back())]);
        let audit = Arc::new(RecordingAudit::default());
        let coordinator = coordinator_with(
            ReconnectionConfig::default(),
            probe.clone(),
            CircuitBreakerConfig::default(),
            audit.clone(),
        );
        let mut rx = coordinator.subscribe();
        let id = BroadcastId::from(42);

        assert!(coordinator.trigger(id.clone(), DisconnectionCategory::SourceDisconnected));
        let events = collect_until_terminal(&mut rx).await;

        let statuses: Vec<_> = events.iter().map(|(e, _)| (e.status, e.attempt_number)).collect();
        assert_eq!(
            statuses,
            vec![
                (ReconnectionStatus::Started, 0),
                (ReconnectionStatus::Attempting, 1),
                (ReconnectionStatus::Attempting, 2),
                (ReconnectionStatus::Attempting, 3),
                (ReconnectionStatus::Success, 3),
            ]
        );
        assert_eq!(events[0].0.next_delay_ms, Some(1_000));
        assert_near(events[1].1, 1_000);
        assert_near(events[2].1, 3_000);
        assert_near(events[3].1, 7_000);
        assert_eq!(events[1].0.next_delay_ms, Some(2_000));

        assert!(!coordinator.is_reconnecting(&id));
        assert!(coordinator.attempt(&id).is_none());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(audit.event_types(), vec![AuditEventType::BroadcastRecovery]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_is_ignored() {
        let coordinator = coordinator(ScriptedProbe::new(Vec::new()));
        let mut rx = coordinator.subscribe();
        let id = BroadcastId::from(7);

        assert!(coordinator.trigger(id.clone(), DisconnectionCategory::SourceDisconnected));
        assert!(!coordinator.trigger(id.clone(), DisconnectionCategory::NetworkIssue));
        assert_eq!(coordinator.active_count(), 1);

        let tracked = coordinator.attempt(&id).unwrap();
        assert_eq!(tracked.disconnection_category, DisconnectionCategory::SourceDisconnected);
        assert_eq!(rx.recv().await.unwrap().status, ReconnectionStatus::Started);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_timer() {
        let probe = ScriptedProbe::new(Vec::new());
        let coordinator = coordinator(probe.clone());
        let mut rx = coordinator.subscribe();
        let id = BroadcastId::from(9);

        coordinator.trigger(id.clone(), DisconnectionCategory::SourceDisconnected);
        assert_eq!(rx.recv().await.unwrap().status, ReconnectionStatus::Started);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(coordinator.cancel(&id));
        assert!(!coordinator.is_reconnecting(&id));
        assert!(!coordinator.cancel(&id));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_cycle_then_retrigger() {
        let coordinator = coordinator(ScriptedProbe::new(Vec::new()));
        let mut rx = coordinator.subscribe();
        let id = BroadcastId::from(10);

        coordinator.trigger(id.clone(), DisconnectionCategory::NetworkIssue);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        coordinator.cancel(&id);
        assert!(coordinator.trigger(id.clone(), DisconnectionCategory::NetworkIssue));

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            statuses.push((event.status, event.attempt_number));
        }
        assert_eq!(
            statuses,
            vec![
                (ReconnectionStatus::Started, 0),
                (ReconnectionStatus::Attempting, 1),
                (ReconnectionStatus::Started, 0),
            ]
        );
        assert_eq!(coordinator.attempt(&id).unwrap().attempt_count, 0);
        coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_failed() {
        let audit = Arc::new(RecordingAudit::default());
        let config = ReconnectionConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let coordinator = coordinator_with(
            config,
            ScriptedProbe::new(Vec::new()),
            CircuitBreakerConfig::default(),
            audit.clone(),
        );
        let mut rx = coordinator.subscribe();
        let id = BroadcastId::from(11);

        coordinator.trigger(id.clone(), DisconnectionCategory::SourceDisconnected);
        let events = collect_until_terminal(&mut rx).await;

        let last = &events.last().unwrap().0;
        assert_eq!(last.status, ReconnectionStatus::Failed);
        assert_eq!(last.attempt_number, 3);
        assert_eq!(last.next_delay_ms, None);
        assert_eq!(events.len(), 5);
        assert!(!coordinator.is_reconnecting(&id));
        assert_eq!(audit.event_types(), vec![AuditEventType::BroadcastRecoveryFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_counts_as_not_restored() {
        let probe = ScriptedProbe::new(vec![Err(Error::upstream("connection refused"))]);
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_ms: 600_000,
            half_open_success_threshold: 1,
        };
        let config = ReconnectionConfig {
            max_attempts: 4,
            ..Default::default()
        };
        let coordinator = coordinator_with(config, probe.clone(), breaker, Arc::new(RecordingAudit::default()));
        let mut rx = coordinator.subscribe();

        coordinator.trigger(BroadcastId::from(12), DisconnectionCategory::NetworkIssue);
        let events = collect_until_terminal(&mut rx).await;

        assert_eq!(events.last().unwrap().0.status, ReconnectionStatus::Failed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_recoverable_categories_are_ignored() {
        let coordinator = coordinator(ScriptedProbe::new(Vec::new()));
        let id = BroadcastId::from(13);

        assert!(!coordinator.trigger(id.clone(), DisconnectionCategory::ServerIssue));
        assert!(!coordinator.trigger(id.clone(), DisconnectionCategory::Unknown));
        assert!(!coordinator.is_reconnecting(&id));
    }

    #[tokio::test]
    async fn test_disabled_config_ignores_trigger() {
        let config = ReconnectionConfig {
            enabled: false,
            ..Default::default()
        };
        let coordinator = coordinator_with(
            config,
            ScriptedProbe::new(Vec::new()),
            CircuitBreakerConfig::default(),
            Arc::new(RecordingAudit::default()),
        );
        assert!(!coordinator.trigger(BroadcastId::from(14), DisconnectionCategory::SourceDisconnected));
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_subscription_filters_by_broadcast() {
        let coordinator = coordinator(ScriptedProbe::new(vec![Ok(source_back()), Ok(source_back())]));
        let mut only_two = coordinator.subscribe_topic(Topic::Broadcast(BroadcastId::from(2)));

        coordinator.trigger(BroadcastId::from(1), DisconnectionCategory::SourceDisconnected);
        coordinator.trigger(BroadcastId::from(2), DisconnectionCategory::SourceDisconnected);

        let first = only_two.recv().await.unwrap();
        assert_eq!(first.broadcast_id, BroadcastId::from(2));
        assert_eq!(first.status, ReconnectionStatus::Started);
        coordinator.shutdown();
        assert_eq!(coordinator.active_count(), 0);
    }
}
