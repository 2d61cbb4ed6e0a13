//! Circuit breaker guarding the upstream streaming server.
//!
//! | From     | Event                              | To       |
//! |----------|------------------------------------|----------|
//! | Closed   | failures reach `failure_threshold` | Open     |
//! | Open     | `allow_request` after `timeout`    | HalfOpen |
//! | HalfOpen | any failure                        | Open     |
//! | HalfOpen | `half_open_success_threshold` wins | Closed   |
//!
//! A blocked request is a plain `false` from [`CircuitBreaker::allow_request`],
//! never an error. Every transition is written to the audit sink.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Error;
use crate::collaborators::{AuditEventType, Collaborators};
use crate::scheduler::millis;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open after the last failure, in milliseconds.
    pub timeout_ms: u64,
    /// Consecutive successes in HalfOpen that close the circuit.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 60_000,
            half_open_success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are blocked until the timeout elapses.
    Open,
    /// Probation: requests flow, one failure reopens.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    fn audit_event(&self) -> AuditEventType {
        match self {
            Self::Closed => AuditEventType::CircuitBreakerClosed,
            Self::Open => AuditEventType::CircuitBreakerOpen,
            Self::HalfOpen => AuditEventType::CircuitBreakerHalfOpen,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probation_successes: u32,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ago_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    probation_successes: u32,
}

/// A transition captured under the lock and audited after releasing it.
struct Transition {
    from: CircuitState,
    to: CircuitState,
    consecutive_failures: u32,
    probation_successes: u32,
    reason: &'static str,
}

/// Outcome of [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum Guarded<T> {
    /// The circuit is open; the dependency was not called.
    Blocked,
    Failed(Error),
    Completed(T),
}

impl<T> Guarded<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Circuit breaker for one guarded dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    collaborators: Collaborators,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                probation_successes: 0,
            }),
            collaborators,
        }
    }

    /// Get the current state without triggering any transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Check whether a request may go to the dependency.
    ///
    /// In Open this is where the timeout is evaluated: the first call after
    /// it has elapsed moves the breaker to HalfOpen and returns `true`.
    pub fn allow_request(&self) -> bool {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    let cooled_down = inner
                        .last_failure_at
                        .is_none_or(|at| at.elapsed() > self.config.timeout());
                    if !cooled_down {
                        debug!(breaker = %self.name, "Circuit breaker is open, request blocked");
                        return false;
                    }

                    inner.state = CircuitState::HalfOpen;
                    inner.probation_successes = 0;
                    Transition {
                        from: CircuitState::Open,
                        to: CircuitState::HalfOpen,
                        consecutive_failures: inner.consecutive_failures,
                        probation_successes: 0,
                        reason: "Open timeout elapsed",
                    }
                }
            }
        };

        info!(breaker = %self.name, "Circuit breaker transitioned to half-open state");
        self.audit(transition);
        true
    }

    /// Record a successful call to the dependency.
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.probation_successes += 1;
                    if inner.probation_successes >= self.config.half_open_success_threshold {
                        let successes = inner.probation_successes;
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.probation_successes = 0;
                        Some(Transition {
                            from: CircuitState::HalfOpen,
                            to: CircuitState::Closed,
                            consecutive_failures: 0,
                            probation_successes: successes,
                            reason: "Probation succeeded",
                        })
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };

        if let Some(transition) = transition {
            info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
            self.audit(transition);
        }
    }

    /// Record a failed call to the dependency.
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.last_failure_at = Some(Instant::now());
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

            match inner.state {
                CircuitState::HalfOpen => {
                    let successes = inner.probation_successes;
                    inner.state = CircuitState::Open;
                    inner.probation_successes = 0;
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                        consecutive_failures: inner.consecutive_failures,
                        probation_successes: successes,
                        reason: "Failure in HALF_OPEN state",
                    })
                }
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    inner.state = CircuitState::Open;
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                        consecutive_failures: inner.consecutive_failures,
                        probation_successes: 0,
                        reason: "Failure threshold exceeded",
                    })
                }
                _ => None,
            }
        };

        if let Some(transition) = transition {
            warn!(
                breaker = %self.name,
                failures = transition.consecutive_failures,
                "Circuit breaker opened: {}",
                transition.reason
            );
            self.audit(transition);
        }
    }

    /// Reset to Closed, clearing all counters. Not audited.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.probation_successes = 0;
        info!(breaker = %self.name, "Circuit breaker manually reset to closed state");
    }

    /// Run `call` through the breaker, recording its outcome.
    ///
    /// The future is not polled at all when the circuit is open.
    pub async fn call<T, F>(&self, call: F) -> Guarded<T>
    where
        F: Future<Output = crate::Result<T>>,
    {
        if !self.allow_request() {
            return Guarded::Blocked;
        }
        match call.await {
            Ok(value) => {
                self.record_success();
                Guarded::Completed(value)
            }
            Err(e) => {
                self.record_failure();
                Guarded::Failed(e)
            }
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            probation_successes: inner.probation_successes,
            last_failure_ago_ms: inner
                .last_failure_at
                .map(|at| millis(at.elapsed())),
        }
    }

    fn audit(&self, transition: Transition) {
        let message = format!(
            "Circuit breaker '{}' transitioned {} -> {} ({}, failureCount: {})",
            self.name,
            transition.from,
            transition.to,
            transition.reason,
            transition.consecutive_failures
        );
        self.collaborators.audit(
            transition.to.audit_event(),
            message,
            None,
            json!({
                "breaker": self.name,
                "oldState": transition.from.as_str(),
                "newState": transition.to.as_str(),
                "failureCount": transition.consecutive_failures,
                "halfOpenSuccessCount": transition.probation_successes,
                "threshold": self.config.failure_threshold,
                "reason": transition.reason,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::RecordingAudit;
    use std::sync::Arc;

    fn breaker(audit: Arc<RecordingAudit>) -> CircuitBreaker {
        CircuitBreaker::new(
            "icecast",
            CircuitBreakerConfig {
                failure_threshold: 3,
                timeout_ms: 1_000,
                half_open_success_threshold: 2,
            },
            Collaborators::noop().with_audit(audit),
        )
    }

    #[test]
    fn test_circuit_breaker_closed() {
        let breaker = breaker(Arc::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_circuit_breaker_opens_on_failures() {
        let breaker = breaker(Arc::default());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let breaker = breaker(Arc::default());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let breaker = breaker(Arc::default());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_failure_reopens() {
        let breaker = breaker(Arc::default());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(breaker.allow_request());

        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closes_after_probation() {
        let audit = Arc::new(RecordingAudit::default());
        let breaker = breaker(audit.clone());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(
            audit.event_types(),
            vec![
                AuditEventType::CircuitBreakerOpen,
                AuditEventType::CircuitBreakerHalfOpen,
                AuditEventType::CircuitBreakerClosed,
            ]
        );

        let records = audit.records.lock();
        assert_eq!(records[0].metadata["oldState"], "CLOSED");
        assert_eq!(records[0].metadata["newState"], "OPEN");
        assert_eq!(records[0].metadata["failureCount"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_open_extends_timeout() {
        let breaker = breaker(Arc::default());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(800)).await;
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(800)).await;

        assert!(!breaker.allow_request());
        assert_eq!(breaker.failure_count(), 4);
    }

    #[test]
    fn test_circuit_breaker_reset() {
        let breaker = breaker(Arc::default());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_skips_future_when_open() {
        let breaker = breaker(Arc::new(RecordingAudit::default()));
        for _ in 0..3 {
            let outcome = breaker
                .call(async { Err::<(), _>(Error::upstream("refused")) })
                .await;
            assert!(matches!(outcome, Guarded::Failed(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let polled = std::sync::atomic::AtomicBool::new(false);
        let outcome = breaker
            .call(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(outcome, Guarded::Blocked));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(breaker.call(async { Ok(5) }).await.completed(), Some(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
