use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;
use crate::domain::BroadcastId;

/// Kinds of audit records the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    BroadcastStarted,
    BroadcastEnded,
    BroadcastFailed,
    CircuitBreakerOpen,
    CircuitBreakerHalfOpen,
    CircuitBreakerClosed,
    BroadcastRecovery,
    BroadcastRecoveryFailed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BroadcastStarted => "BROADCAST_STARTED",
            Self::BroadcastEnded => "BROADCAST_ENDED",
            Self::BroadcastFailed => "BROADCAST_FAILED",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::CircuitBreakerHalfOpen => "CIRCUIT_BREAKER_HALF_OPEN",
            Self::CircuitBreakerClosed => "CIRCUIT_BREAKER_CLOSED",
            Self::BroadcastRecovery => "BROADCAST_RECOVERY",
            Self::BroadcastRecoveryFailed => "BROADCAST_RECOVERY_FAILED",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub message: String,
    pub subject_id: Option<BroadcastId>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        event_type: AuditEventType,
        message: impl Into<String>,
        subject_id: Option<BroadcastId>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            message: message.into(),
            subject_id,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for audit records.
///
/// Implementations must return quickly; anything slow belongs on a queue
/// behind the sink.
pub trait AuditSink: Send + Sync {
    fn log_event(&self, record: AuditRecord) -> Result<()>;
}

/// Discards every record.
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn log_event(&self, _record: AuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Writes audit records to the `audit` tracing target.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn log_event(&self, record: AuditRecord) -> Result<()> {
        info!(
            target: "audit",
            event_type = %record.event_type,
            subject_id = record.subject_id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
            metadata = %record.metadata,
            "{}",
            record.message
        );
        Ok(())
    }
}
