use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::classifier::{HealthProbe, HealthSignals, StreamHealthClassifier};
use crate::domain::{BroadcastId, DisconnectionCategory};
use crate::reconnection::{ReconnectionCoordinator, ReconnectionEvent, ReconnectionStatus};
use crate::relay::{RelayEvent, RelayRegistry};
use crate::resilience::{CircuitBreaker, Guarded};
use crate::scheduler::{RecurringTimer, Scheduler};
use crate::upstream::SourceProbe;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    pub interval_ms: u64,
    /// After a broadcast starts, a missing mount is expected for this long.
    pub startup_grace_ms: u64,
    /// A broadcast whose relay ended is dropped after this long without a
    /// new session or an active recovery.
    pub release_after_ms: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            startup_grace_ms: 60_000,
            release_after_ms: 300_000,
        }
    }
}

impl HealthMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn release_after(&self) -> Duration {
        Duration::from_millis(self.release_after_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    /// Start of the current relay session.
    since: Instant,
    relay_gone_at: Option<Instant>,
}

impl Watch {
    fn new() -> Self {
        Self {
            since: Instant::now(),
            relay_gone_at: None,
        }
    }
}

/// Result of the most recent check for a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub category: DisconnectionCategory,
    pub signals: HealthSignals,
    pub checked_at: DateTime<Utc>,
    /// Whether this check started a reconnection.
    pub triggered_recovery: bool,
}

/// Periodically probes every live broadcast and hands recoverable
/// disconnections to the [`ReconnectionCoordinator`].
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    classifier: StreamHealthClassifier,
    probe: Arc<dyn SourceProbe>,
    breaker: Arc<CircuitBreaker>,
    relays: Arc<RelayRegistry>,
    coordinator: Arc<ReconnectionCoordinator>,
    watched: DashMap<BroadcastId, Watch>,
    reports: DashMap<BroadcastId, HealthReport>,
    /// Broadcasts whose recovery ran out of attempts. No new recovery is
    /// started for them until the source is seen again or a relay restarts.
    exhausted: DashMap<BroadcastId, Instant>,
    timer: Mutex<Option<RecurringTimer>>,
    events_token: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        classifier: StreamHealthClassifier,
        probe: Arc<dyn SourceProbe>,
        breaker: Arc<CircuitBreaker>,
        relays: Arc<RelayRegistry>,
        coordinator: Arc<ReconnectionCoordinator>,
    ) -> Self {
        Self {
            config,
            classifier,
            probe,
            breaker,
            relays,
            coordinator,
            watched: DashMap::new(),
            reports: DashMap::new(),
            exhausted: DashMap::new(),
            timer: Mutex::new(None),
            events_token: CancellationToken::new(),
        }
    }

    /// Start the recurring check and follow relay lifecycle events.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let monitor = Arc::downgrade(self);
        let timer = scheduler.recurring("health-monitor", self.config.interval(), move || {
            let monitor = monitor.clone();
            async move {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.check_all().await;
                }
            }
        });
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.stop();
        }

        let monitor = Arc::downgrade(self);
        let mut events = self.relays.subscribe();
        let token = self.events_token.clone();
        scheduler.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some(monitor) = monitor.upgrade() else { break };
                match event {
                    RelayEvent::Started { broadcast_id, .. } => monitor.watch(broadcast_id),
                    RelayEvent::Ended { broadcast_id, .. } | RelayEvent::Failed { broadcast_id, .. } => {
                        monitor.relay_gone(&broadcast_id);
                        monitor.check(&broadcast_id).await;
                    }
                }
            }
        });

        let monitor = Arc::downgrade(self);
        let mut recoveries = self.coordinator.subscribe();
        let token = self.events_token.clone();
        scheduler.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = recoveries.recv() => event,
                };
                match event {
                    Ok(event) => match monitor.upgrade() {
                        Some(monitor) => monitor.on_reconnection_event(&event),
                        None => break,
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!(interval_ms = self.config.interval_ms, "Health monitor started");
    }

    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
        self.events_token.cancel();
    }

    /// Begin watching a broadcast for a new relay session.
    ///
    /// Re-watching restarts the startup grace period and forgets the
    /// previous session's report.
    pub fn watch(&self, broadcast_id: BroadcastId) {
        self.exhausted.remove(&broadcast_id);
        self.reports.remove(&broadcast_id);
        if self.watched.insert(broadcast_id.clone(), Watch::new()).is_none() {
            debug!(%broadcast_id, "Watching broadcast health");
        } else {
            debug!(%broadcast_id, "New relay session, health watch restarted");
        }
    }

    /// Forget a broadcast entirely, including an exhausted recovery.
    pub fn unwatch(&self, broadcast_id: &BroadcastId) {
        self.release(broadcast_id);
        self.exhausted.remove(broadcast_id);
    }

    /// Stop probing a broadcast. An exhausted marker is kept.
    fn release(&self, broadcast_id: &BroadcastId) {
        if self.watched.remove(broadcast_id).is_some() {
            debug!(%broadcast_id, "Stopped watching broadcast health");
        }
        self.reports.remove(broadcast_id);
    }

    fn relay_gone(&self, broadcast_id: &BroadcastId) {
        if let Some(mut watch) = self.watched.get_mut(broadcast_id) {
            watch.relay_gone_at.get_or_insert_with(Instant::now);
        }
    }

    /// Whether nothing is left to watch for: no relay, no recovery, and the
    /// relay has been gone for the release window.
    fn is_settled(&self, broadcast_id: &BroadcastId) -> bool {
        let Some(gone_at) = self.watched.get(broadcast_id).and_then(|w| w.relay_gone_at) else {
            return false;
        };
        gone_at.elapsed() >= self.config.release_after()
            && !self.relays.is_active(broadcast_id)
            && !self.coordinator.is_reconnecting(broadcast_id)
    }

    /// Whether recovery gave up and the broadcast is waiting on an operator.
    pub fn is_exhausted(&self, broadcast_id: &BroadcastId) -> bool {
        self.exhausted.contains_key(broadcast_id)
    }

    fn on_reconnection_event(&self, event: &ReconnectionEvent) {
        if event.status != ReconnectionStatus::Failed || !self.is_watching(&event.broadcast_id) {
            return;
        }
        self.exhausted.insert(event.broadcast_id.clone(), Instant::now());
        if !self.relays.is_active(&event.broadcast_id) {
            info!(broadcast_id = %event.broadcast_id, "Recovery exhausted with no relay, releasing health watch");
            self.release(&event.broadcast_id);
        }
    }

    pub fn is_watching(&self, broadcast_id: &BroadcastId) -> bool {
        self.watched.contains_key(broadcast_id)
    }

    pub fn latest(&self, broadcast_id: &BroadcastId) -> Option<HealthReport> {
        self.reports.get(broadcast_id).map(|r| r.clone())
    }

    pub async fn check_all(&self) {
        let release_after = self.config.release_after();
        self.exhausted.retain(|id, since| {
            self.watched.contains_key(id) || since.elapsed() < release_after
        });

        let ids: Vec<BroadcastId> = self.watched.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if self.is_settled(&id) {
                info!(broadcast_id = %id, "Broadcast ended, releasing health watch");
                self.release(&id);
                continue;
            }
            self.check(&id).await;
        }
    }

    /// Probe and classify one watched broadcast.
    ///
    /// Returns `None` if the broadcast is not watched or the circuit is open.
    pub async fn check(&self, broadcast_id: &BroadcastId) -> Option<HealthReport> {
        if !self.watched.contains_key(broadcast_id) {
            return None;
        }

        let probe = match self.breaker.call(self.probe.probe(broadcast_id)).await {
            Guarded::Completed(probe) => probe,
            Guarded::Failed(e) => {
                debug!(%broadcast_id, error = %e, "Health probe could not reach upstream");
                HealthProbe::unreachable()
            }
            Guarded::Blocked => {
                debug!(%broadcast_id, "Circuit open, skipping health probe");
                return None;
            }
        };

        // Re-read: the broadcast may have been unwatched or restarted while
        // the probe was in flight.
        let watch = *self.watched.get(broadcast_id)?;

        let probe = HealthProbe {
            within_grace_period: watch.since.elapsed() < self.config.startup_grace(),
            ..probe
        };
        if probe.is_source_restored() && self.exhausted.remove(broadcast_id).is_some() {
            info!(%broadcast_id, "Source is back after exhausted recovery");
        }

        let signals = HealthSignals::from_probe(&probe, self.relays.is_transcoder_available());
        let category = self.classifier.classify(&signals);

        let triggered_recovery = category.supports_automatic_recovery()
            && !self.is_exhausted(broadcast_id)
            && !self.coordinator.is_reconnecting(broadcast_id)
            && self.coordinator.trigger(broadcast_id.clone(), category);
        if triggered_recovery {
            info!(%broadcast_id, %category, "Recoverable disconnection detected");
        } else if category.requires_operator_intervention() {
            debug!(%broadcast_id, %category, "Disconnection needs an operator");
        }

        let report = HealthReport {
            category,
            signals,
            checked_at: Utc::now(),
            triggered_recovery,
        };
        self.reports.insert(broadcast_id.clone(), report.clone());
        Some(report)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.events_token.cancel();
    }
}
