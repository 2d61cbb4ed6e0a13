//! Capabilities the core calls into but never implements itself.
//!
//! Both sinks are optional. [`Collaborators`] is resolved once at
//! construction and falls back to no-op implementations, so call sites never
//! check whether a collaborator is present. Sink failures are logged here and
//! never reach the relay or recovery paths.

mod audit;
mod notification;

pub use audit::{AuditEventType, AuditRecord, AuditSink, NoopAudit, TracingAudit};
pub use notification::{
    NoopNotifier, Notification, NotificationKind, NotificationSink, WebhookConfig,
    WebhookNotifier,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::BroadcastId;

/// Upper bound on a single best-effort notification delivery.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// The resolved set of collaborator sinks.
#[derive(Clone)]
pub struct Collaborators {
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
}

impl Collaborators {
    pub fn new(audit: Arc<dyn AuditSink>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { audit, notifier }
    }

    /// Collaborators that discard everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopAudit), Arc::new(NoopNotifier))
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Record an audit event. Never fails.
    pub fn audit(
        &self,
        event_type: AuditEventType,
        message: impl Into<String>,
        subject_id: Option<&BroadcastId>,
        metadata: serde_json::Value,
    ) {
        let record = AuditRecord::new(event_type, message, subject_id.cloned(), metadata);
        if let Err(e) = self.audit.log_event(record) {
            warn!(event_type = %event_type, error = %e, "Audit sink rejected event");
        }
    }

    /// Deliver a notification in the background. Never blocks the caller.
    pub fn notify(&self, notification: Notification) {
        let notifier = self.notifier.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, dropping notification");
            return;
        };

        runtime.spawn(async move {
            let kind = notification.kind;
            match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&notification)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(kind = %kind, error = %e, "Notification delivery failed"),
                Err(_) => warn!(kind = %kind, "Notification delivery timed out"),
            }
        });
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::noop()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_audit_forwards_to_sink() {
        let sink = Arc::new(RecordingAudit::default());
        let collaborators = Collaborators::noop().with_audit(sink.clone());

        collaborators.audit(
            AuditEventType::BroadcastStarted,
            "started",
            Some(&BroadcastId::from(7)),
            serde_json::json!({ "k": 1 }),
        );

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject_id, Some(BroadcastId::from(7)));
        assert_eq!(records[0].metadata["k"], 1);
    }

    #[test]
    fn test_failing_audit_is_swallowed() {
        let collaborators = Collaborators::noop().with_audit(Arc::new(FailingAudit));
        collaborators.audit(
            AuditEventType::BroadcastEnded,
            "ended",
            None,
            serde_json::Value::Null,
        );
    }

    #[test]
    fn test_notify_without_runtime_is_dropped() {
        let collaborators = Collaborators::noop();
        collaborators.notify(Notification::new(
            NotificationKind::BroadcastFailed,
            BroadcastId::from(1),
            "no runtime",
        ));
    }
}
