use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::scheduler::{RecurringTimer, Scheduler};
use crate::upstream::{StatusSource, UpstreamStatus};

/// StatusCache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCacheConfig {
    pub ttl_ms: u64,
    /// Upper bound on a single upstream fetch.
    pub fetch_timeout_ms: u64,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            fetch_timeout_ms: 3_000,
        }
    }
}

impl StatusCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// A cache read: the best known status plus the last refresh error, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStatus {
    pub status: UpstreamStatus,
    /// When `status` was fetched. `None` if upstream has never answered.
    pub fetched_at: Option<DateTime<Utc>>,
    /// Set when the most recent refresh failed.
    pub error: Option<String>,
}

impl CachedStatus {
    pub fn is_stale(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Default)]
struct Slot {
    good: Option<(UpstreamStatus, DateTime<Utc>)>,
    /// Time of the last refresh attempt, successful or not.
    refreshed_at: Option<Instant>,
    error: Option<String>,
}

impl Slot {
    fn read(&self) -> CachedStatus {
        CachedStatus {
            status: self.good.map(|(s, _)| s).unwrap_or_default(),
            fetched_at: self.good.map(|(_, at)| at),
            error: self.error.clone(),
        }
    }
}

/// TTL cache in front of a [`StatusSource`].
///
/// Refreshes are serialized, so concurrent readers coalesce onto a single
/// upstream call. A failed refresh keeps the last-known-good status and
/// attaches an error marker; it also counts as a refresh for TTL purposes,
/// so a dead upstream is asked at most once per TTL.
pub struct StatusCache {
    source: Arc<dyn StatusSource>,
    config: StatusCacheConfig,
    slot: Mutex<Slot>,
    upstream_reads: AtomicU64,
    timer: parking_lot::Mutex<Option<RecurringTimer>>,
}

impl StatusCache {
    pub fn new(source: Arc<dyn StatusSource>, config: StatusCacheConfig) -> Self {
        Self {
            source,
            config,
            slot: Mutex::new(Slot::default()),
            upstream_reads: AtomicU64::new(0),
            timer: parking_lot::Mutex::new(None),
        }
    }

    /// Refresh once per TTL for as long as `wanted()` holds.
    ///
    /// Readers in between are served from the cache, so an active broadcast
    /// costs one upstream call per TTL however many readers there are.
    pub fn start_refresh<F>(self: &Arc<Self>, scheduler: &Scheduler, wanted: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let cache = Arc::downgrade(self);
        let wanted = Arc::new(wanted);
        let timer = scheduler.recurring("status-cache", self.config.ttl(), move || {
            let cache = cache.clone();
            let wanted = wanted.clone();
            async move {
                if let Some(cache) = cache.upgrade() {
                    if wanted() {
                        cache.refresh().await;
                    }
                }
            }
        });
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.stop();
        }
    }

    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
    }

    /// Read the status, refreshing first if the cache is empty or expired.
    pub async fn get(&self) -> CachedStatus {
        let mut slot = self.slot.lock().await;
        let expired = slot
            .refreshed_at
            .is_none_or(|at| at.elapsed() > self.config.ttl());
        if expired {
            self.refresh_locked(&mut slot).await;
        }
        slot.read()
    }

    /// Refresh unconditionally.
    pub async fn refresh(&self) -> CachedStatus {
        let mut slot = self.slot.lock().await;
        self.refresh_locked(&mut slot).await;
        slot.read()
    }

    /// Current contents without touching upstream.
    pub async fn peek(&self) -> CachedStatus {
        self.slot.lock().await.read()
    }

    /// Number of upstream fetches issued so far.
    pub fn upstream_reads(&self) -> u64 {
        self.upstream_reads.load(Ordering::Relaxed)
    }

    async fn refresh_locked(&self, slot: &mut Slot) {
        self.upstream_reads.fetch_add(1, Ordering::Relaxed);
        let fetched = tokio::time::timeout(self.config.fetch_timeout(), self.source.fetch_status()).await;
        slot.refreshed_at = Some(Instant::now());

        match fetched {
            Ok(Ok(status)) => {
                debug!(?status, "Refreshed upstream status");
                slot.good = Some((status, Utc::now()));
                slot.error = None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Upstream status refresh failed, serving last known status");
                slot.error = Some(e.to_string());
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.fetch_timeout_ms,
                    "Upstream status refresh timed out, serving last known status"
                );
                slot.error = Some(format!(
                    "Upstream status timed out after {}ms",
                    self.config.fetch_timeout_ms
                ));
            }
        }
    }
}
