//! Service container for the relay core.
//!
//! Holds every long-lived component and owns their start and shutdown
//! order. Background work runs on the container's [`Scheduler`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::Collaborators;
use crate::config::AppConfig;
use crate::domain::BroadcastId;
use crate::fanout::ListenerStatusFanout;
use crate::health::{HealthMonitor, StreamHealthClassifier};
use crate::reconnection::ReconnectionCoordinator;
use crate::relay::{LaunchSpec, RelayRegistry};
use crate::resilience::{CircuitBreaker, CircuitSnapshot};
use crate::scheduler::Scheduler;
use crate::status::{CachedStatus, StatusCache};
use crate::upstream::{IcecastClient, SourceProbe, StatusSource};
use crate::Result;

/// Name of the breaker guarding upstream health probes.
pub const UPSTREAM_CIRCUIT: &str = "icecast-status";

/// How long `shutdown` waits for relay sessions to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The upstream seams the core talks to.
#[derive(Clone)]
pub struct Upstream {
    pub status: Arc<dyn StatusSource>,
    pub probe: Arc<dyn SourceProbe>,
}

impl Upstream {
    /// Both seams served by one Icecast client.
    pub fn icecast(config: &AppConfig) -> Result<Self> {
        let client = Arc::new(IcecastClient::new(
            &config.ingest.status_url(),
            config.ingest.mount.clone(),
            config.status_cache.fetch_timeout(),
        )?);
        Ok(Self {
            status: client.clone(),
            probe: client,
        })
    }
}

/// Every component of the running relay core.
pub struct ServiceContainer {
    pub relays: Arc<RelayRegistry>,
    pub status_cache: Arc<StatusCache>,
    pub fanout: Arc<ListenerStatusFanout>,
    pub reconnection: Arc<ReconnectionCoordinator>,
    pub health_monitor: Arc<HealthMonitor>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    scheduler: Scheduler,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub fn new(
        config: &AppConfig,
        upstream: Upstream,
        launch: LaunchSpec,
        collaborators: Collaborators,
        scheduler: Scheduler,
    ) -> Self {
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            UPSTREAM_CIRCUIT,
            config.circuit_breaker.clone(),
            collaborators.clone(),
        ));
        let relays = Arc::new(RelayRegistry::new(
            launch,
            config.transcoder.timings(),
            collaborators.clone(),
        ));
        let status_cache = Arc::new(StatusCache::new(
            upstream.status,
            config.status_cache.clone(),
        ));
        let fanout = Arc::new(ListenerStatusFanout::new(
            relays.clone(),
            status_cache.clone(),
            config.fanout.clone(),
        ));
        let reconnection = Arc::new(ReconnectionCoordinator::new(
            config.reconnection.clone(),
            upstream.probe.clone(),
            circuit_breaker.clone(),
            scheduler.clone(),
            collaborators,
        ));
        let health_monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            StreamHealthClassifier::new(config.classifier.clone()),
            upstream.probe,
            circuit_breaker.clone(),
            relays.clone(),
            reconnection.clone(),
        ));

        Self {
            relays,
            status_cache,
            fanout,
            reconnection,
            health_monitor,
            circuit_breaker,
            scheduler,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Build the production container: Icecast upstream and ffmpeg relay.
    pub fn from_config(
        config: &AppConfig,
        collaborators: Collaborators,
        scheduler: Scheduler,
    ) -> Result<Self> {
        let upstream = Upstream::icecast(config)?;
        let launch = LaunchSpec::ffmpeg(&config.transcoder, &config.ingest)?;
        info!(command = %launch.display(), "Relay transcoder command");
        Ok(Self::new(config, upstream, launch, collaborators, scheduler))
    }

    /// Start the status refresh, fan-out and health check timers.
    pub fn initialize(&self) {
        let relays = self.relays.clone();
        self.status_cache
            .start_refresh(&self.scheduler, move || relays.is_any_active());
        self.fanout.start(&self.scheduler);
        self.health_monitor.start(&self.scheduler);
        info!("Relay core initialized");
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// End a broadcast on operator request.
    ///
    /// Stops watching its health, cancels any recovery and stops its relay.
    /// Returns whether anything was running for it.
    pub fn end_broadcast(&self, broadcast_id: &BroadcastId) -> bool {
        self.health_monitor.unwatch(broadcast_id);
        let cancelled = self.reconnection.cancel(broadcast_id);
        let stopped = self.relays.stop(broadcast_id);
        info!(%broadcast_id, cancelled, stopped, "Broadcast ended by operator");
        cancelled || stopped
    }

    /// Stop every background task and relay session.
    pub async fn shutdown(&self) {
        info!("Shutting down relay core");
        self.cancellation_token.cancel();

        self.status_cache.stop();
        self.fanout.stop();
        self.health_monitor.stop();
        self.reconnection.shutdown();
        self.relays.stop_all();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.relays.is_any_active() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                active = self.relays.active_count(),
                "Relay sessions still active at shutdown"
            );
        }

        self.scheduler.shutdown();
        info!("Relay core shut down");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Point-in-time view of the core, without touching upstream.
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_relays: self.relays.active_count(),
            transcoder_available: self.relays.is_transcoder_available(),
            listener_connections: self.fanout.connection_count(),
            active_recoveries: self.reconnection.active_count(),
            circuit: self.circuit_breaker.snapshot(),
            upstream: self.status_cache.peek().await,
        }
    }
}

/// Runtime statistics reported by `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub active_relays: usize,
    pub transcoder_available: bool,
    pub listener_connections: usize,
    pub active_recoveries: usize,
    pub circuit: CircuitSnapshot,
    pub upstream: CachedStatus,
}

#[cfg(test)]
pub(crate) mod testing {
    //! A container wired to in-memory upstream fakes.

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::health::HealthProbe;
    use crate::upstream::UpstreamStatus;

    /// Upstream whose liveness is flipped by the test.
    #[derive(Default)]
    pub struct FakeUpstream {
        pub live: AtomicBool,
    }

    #[async_trait]
    impl StatusSource for FakeUpstream {
        async fn fetch_status(&self) -> Result<UpstreamStatus> {
            let live = self.live.load(Ordering::SeqCst);
            Ok(UpstreamStatus {
                is_live: live,
                listener_count: if live { 3 } else { 0 },
                peak_listener_count: 5,
            })
        }
    }

    #[async_trait]
    impl SourceProbe for FakeUpstream {
        async fn probe(&self, _broadcast_id: &BroadcastId) -> Result<HealthProbe> {
            let live = self.live.load(Ordering::SeqCst);
            Ok(HealthProbe {
                server_reachable: true,
                mount_point_exists: live,
                has_active_source: live,
                bitrate: if live { 128 } else { 0 },
                within_grace_period: false,
            })
        }
    }

    pub fn container(upstream: Arc<FakeUpstream>) -> ServiceContainer {
        ServiceContainer::new(
            &AppConfig::default(),
            Upstream {
                status: upstream.clone(),
                probe: upstream,
            },
            LaunchSpec::new("sh", vec!["-c".into(), "cat > /dev/null".into()]),
            Collaborators::noop(),
            Scheduler::current(),
        )
    }
}
