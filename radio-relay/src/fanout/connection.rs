use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Error, Result};

/// Outbound half of a listener's connection.
#[async_trait]
pub trait StatusChannel: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn send_pong(&mut self, payload: Bytes) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Who a listener is, when their token resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerIdentity {
    pub user_id: String,
    pub username: Option<String>,
}

/// One registered listener.
///
/// Every write goes through `sender`'s lock, so periodic pushes,
/// event-triggered pushes and pongs never interleave.
pub struct ListenerConnection {
    pub id: Uuid,
    pub identity: Option<ListenerIdentity>,
    pub connected_at: DateTime<Utc>,
    sender: Mutex<Box<dyn StatusChannel>>,
}

impl ListenerConnection {
    pub fn new(channel: Box<dyn StatusChannel>, identity: Option<ListenerIdentity>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            connected_at: Utc::now(),
            sender: Mutex::new(channel),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        let mut sender = self.sender.lock().await;
        if !sender.is_open() {
            return Err(Error::Other(format!("listener {} is closed", self.id)));
        }
        sender.send_text(text).await
    }

    pub async fn send_pong(&self, payload: Bytes) -> Result<()> {
        self.sender.lock().await.send_pong(payload).await
    }
}
