use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::Result;
use crate::domain::BroadcastId;

/// What a user-facing notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BroadcastStarted,
    BroadcastEnded,
    BroadcastFailed,
    RecoverySucceeded,
    RecoveryFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BroadcastStarted => "BROADCAST_STARTED",
            Self::BroadcastEnded => "BROADCAST_ENDED",
            Self::BroadcastFailed => "BROADCAST_FAILED",
            Self::RecoverySucceeded => "RECOVERY_SUCCEEDED",
            Self::RecoveryFailed => "RECOVERY_FAILED",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A best-effort message for the people running a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub broadcast_id: BroadcastId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, broadcast_id: BroadcastId, message: impl Into<String>) -> Self {
        Self {
            kind,
            broadcast_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Delivery channel for [`Notification`]s.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Drops every notification.
pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// Webhook notifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Target URL; the notifier is disabled when empty.
    pub url: String,
    /// Optional bearer token sent as `Authorization`.
    pub bearer_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            bearer_token: None,
            timeout_secs: 10,
        }
    }
}

/// POSTs notifications as JSON to a configured URL.
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.url.is_empty()
    }

    fn build_payload(notification: &Notification) -> serde_json::Value {
        json!({
            "event_type": notification.kind.as_str(),
            "broadcast_id": notification.broadcast_id,
            "message": notification.message,
            "timestamp": notification.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.config.url)
            .json(&Self::build_payload(notification));
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Webhook failed: {} - {}", status, body);
            return Err(crate::Error::Other(format!("Webhook failed: {} - {}", status, body)));
        }

        debug!("Webhook notification sent: {}", notification.kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_payload_shape() {
        let notification = Notification::new(
            NotificationKind::RecoveryFailed,
            BroadcastId::from(42),
            "gave up",
        );
        let payload = WebhookNotifier::build_payload(&notification);

        assert_eq!(payload["event_type"], "RECOVERY_FAILED");
        assert_eq!(payload["broadcast_id"], "42");
        assert_eq!(payload["message"], "gave up");
    }

    #[tokio::test]
    async fn test_disabled_webhook_is_noop() {
        let notifier = WebhookNotifier::new(WebhookConfig::default());
        assert!(!notifier.is_enabled());

        let notification =
            Notification::new(NotificationKind::BroadcastEnded, BroadcastId::from(1), "done");
        assert!(notifier.notify(&notification).await.is_ok());
    }
}
