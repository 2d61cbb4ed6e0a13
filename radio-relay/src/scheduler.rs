//! Background scheduling.
//!
//! Periodic work (fan-out ticks, health checks, log retention) and all
//! reconnection backoff timers run on a [`Scheduler`], which in production
//! is a small dedicated runtime so a slow timer never competes with request
//! handling. Each recurring concern owns its own [`RecurringTimer`].

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{Error, Result};

/// Default worker count for the dedicated scheduler runtime.
pub const DEFAULT_SCHEDULER_WORKERS: usize = 2;

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct DedicatedRuntime {
    stop: CancellationToken,
}

impl Drop for DedicatedRuntime {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Handle to the runtime that hosts timers and background cycles.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    dedicated: Option<Arc<DedicatedRuntime>>,
}

impl Scheduler {
    /// Start a dedicated multi-thread runtime on its own OS thread.
    ///
    /// The runtime lives until [`Scheduler::shutdown`] is called or the last
    /// clone is dropped.
    pub fn dedicated(workers: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("relay-scheduler")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();

        let stop_signal = stop.clone();
        thread::Builder::new()
            .name("relay-scheduler-host".to_string())
            .spawn(move || {
                runtime.block_on(stop_signal.cancelled());
                runtime.shutdown_timeout(Duration::from_secs(5));
                debug!("Scheduler runtime stopped");
            })
            .map_err(|e| Error::Other(format!("Failed to start scheduler thread: {}", e)))?;

        info!(workers, "Scheduler runtime started");
        Ok(Self {
            handle,
            dedicated: Some(Arc::new(DedicatedRuntime { stop })),
        })
    }

    /// Schedule onto the runtime the caller is already on.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            dedicated: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Start a recurring timer owned by the caller.
    pub fn recurring<F, Fut>(&self, name: impl Into<String>, period: Duration, tick: F) -> RecurringTimer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        RecurringTimer::start(self, name, period, tick)
    }

    /// Stop the dedicated runtime. No-op when wrapping an existing runtime.
    pub fn shutdown(&self) {
        if let Some(dedicated) = &self.dedicated {
            dedicated.stop.cancel();
        }
    }
}

/// A cancellable fixed-rate timer.
///
/// The first tick fires one `period` after start. A tick that overruns its
/// period causes the missed ticks to be skipped, so cycles never stack.
/// Stopping cancels a tick that is mid-flight.
pub struct RecurringTimer {
    name: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RecurringTimer {
    pub fn start<F, Fut>(scheduler: &Scheduler, name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_name = name.clone();

        let task = scheduler.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(timer = %task_name, period_ms = millis(period), "Recurring timer started");

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                trace!(timer = %task_name, "Tick");
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tick() => {}
                }
            }

            debug!(timer = %task_name, "Recurring timer stopped");
        });

        Self {
            name,
            token,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the timer. Safe to call more than once.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop and wait for the timer task to finish.
    pub async fn join(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RecurringTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::from_micros(999)), 0);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_timer_fires_each_period() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let timer = Scheduler::current().recurring("count", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10_200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timer.stop();
        timer.stop();
        assert!(timer.is_stopped());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_skips_instead_of_stacking() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let timer = Scheduler::current().recurring("slow", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2_500)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!(fired <= 4, "ticks stacked: {}", fired);
        timer.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_timer() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let timer = Scheduler::current().recurring("dropped", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(timer);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dedicated_runtime_runs_tasks() {
        let scheduler = Scheduler::dedicated(DEFAULT_SCHEDULER_WORKERS).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.spawn(async move {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        scheduler.shutdown();
    }
}
