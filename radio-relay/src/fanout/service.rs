use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::connection::{ListenerConnection, ListenerIdentity, StatusChannel};
use super::snapshot::StatusSnapshot;
use crate::relay::RelayRegistry;
use crate::scheduler::{RecurringTimer, Scheduler};
use crate::status::StatusCache;

/// Fan-out cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    pub interval_ms: u64,
    /// A listener that does not accept a push within this bound is pruned.
    pub send_timeout_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            send_timeout_ms: 2_000,
        }
    }
}

impl FanoutConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// What asked for a fan-out cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    /// The recurring tick. Dropped if a cycle is already running.
    Tick,
    /// A relay lifecycle change. Re-run once the current cycle finishes.
    Event,
}

/// Result of one fan-out request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// Another cycle was running.
    Busy,
    /// Nobody to tell and nothing live; upstream was not consulted.
    Idle,
    Delivered { recipients: usize, pruned: usize },
}

/// Clears the in-flight flag even if the cycle future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pushes one [`StatusSnapshot`] per cycle to every listener.
pub struct ListenerStatusFanout {
    connections: DashMap<Uuid, Arc<ListenerConnection>>,
    relays: Arc<RelayRegistry>,
    cache: Arc<StatusCache>,
    config: FanoutConfig,
    in_flight: AtomicBool,
    rerun: AtomicBool,
    timer: Mutex<Option<RecurringTimer>>,
    events_token: CancellationToken,
}

impl ListenerStatusFanout {
    pub fn new(relays: Arc<RelayRegistry>, cache: Arc<StatusCache>, config: FanoutConfig) -> Self {
        Self {
            connections: DashMap::new(),
            relays,
            cache,
            config,
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            timer: Mutex::new(None),
            events_token: CancellationToken::new(),
        }
    }

    /// Start the recurring tick and the relay-event listener.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let fanout = Arc::downgrade(self);
        let timer = scheduler.recurring("listener-fanout", self.config.interval(), move || {
            let fanout = fanout.clone();
            async move {
                if let Some(fanout) = fanout.upgrade() {
                    fanout.run_cycle(CycleTrigger::Tick).await;
                }
            }
        });
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.stop();
        }

        let fanout = Arc::downgrade(self);
        let mut events = self.relays.subscribe();
        let token = self.events_token.clone();
        scheduler.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let Some(fanout) = fanout.upgrade() else { break };
                        debug!(broadcast_id = %event.broadcast_id(), "Relay changed, pushing status now");
                        fanout.run_cycle(CycleTrigger::Event).await;
                    }
                    Err(RecvError::Lagged(_)) => {
                        if let Some(fanout) = fanout.upgrade() {
                            fanout.run_cycle(CycleTrigger::Event).await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!(interval_ms = self.config.interval_ms, "Listener status fan-out started");
    }

    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
        self.events_token.cancel();
    }

    pub fn register(&self, channel: Box<dyn StatusChannel>, identity: Option<ListenerIdentity>) -> Arc<ListenerConnection> {
        let connection = Arc::new(ListenerConnection::new(channel, identity));
        self.connections.insert(connection.id, connection.clone());
        debug!(
            connection_id = %connection.id,
            authenticated = connection.is_authenticated(),
            total = self.connections.len(),
            "Listener connected"
        );
        connection
    }

    pub fn unregister(&self, id: &Uuid) {
        if self.connections.remove(id).is_some() {
            debug!(connection_id = %id, total = self.connections.len(), "Listener disconnected");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.connections.contains_key(id)
    }

    /// Current status, through the cache.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let cached = self.cache.get().await;
        StatusSnapshot::compute(&cached, self.relays.current_broadcast_id())
    }

    /// Run a fan-out cycle unless one is already in flight.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> FanoutOutcome {
        let mut last = None;
        loop {
            let Some(guard) = InFlight::acquire(&self.in_flight) else {
                if trigger == CycleTrigger::Event && last.is_none() {
                    self.rerun.store(true, Ordering::Release);
                }
                trace!(?trigger, "Fan-out cycle already running");
                return last.unwrap_or(FanoutOutcome::Busy);
            };

            let outcome = self.cycle().await;
            drop(guard);

            if !self.rerun.swap(false, Ordering::AcqRel) {
                return outcome;
            }
            last = Some(outcome);
        }
    }

    async fn cycle(&self) -> FanoutOutcome {
        if self.connections.is_empty() && !self.relays.is_any_active() {
            return FanoutOutcome::Idle;
        }

        let snapshot = self.snapshot().await;
        let payload = match serde_json::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize status snapshot");
                return FanoutOutcome::Delivered {
                    recipients: 0,
                    pruned: 0,
                };
            }
        };

        let targets: Vec<Arc<ListenerConnection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        let send_timeout = self.config.send_timeout();

        let results = join_all(targets.iter().map(|connection| {
            let payload = payload.clone();
            async move {
                let sent = tokio::time::timeout(send_timeout, connection.send_text(payload)).await;
                (connection.id, sent)
            }
        }))
        .await;

        let mut pruned = 0;
        for (id, result) in results {
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "send timed out".to_string(),
            };
            if self.connections.remove(&id).is_some() {
                debug!(connection_id = %id, %reason, "Pruned listener connection");
                pruned += 1;
            }
        }

        let recipients = targets.len() - pruned;
        trace!(recipients, pruned, is_live = snapshot.is_live, "Fan-out cycle complete");
        FanoutOutcome::Delivered { recipients, pruned }
    }
}

impl Drop for ListenerStatusFanout {
    fn drop(&mut self) {
        self.events_token.cancel();
    }
}
