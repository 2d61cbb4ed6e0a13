//! The streaming ingest server, seen from the relay core.
//!
//! Two seams are exposed: [`StatusSource`] for public listener status and
//! [`SourceProbe`] for per-broadcast source health. [`IcecastClient`]
//! implements both against an Icecast `status-json.xsl` endpoint.

mod icecast;

pub use icecast::{IcecastClient, MountStatus, parse_mount_status};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::domain::BroadcastId;
use crate::health::HealthProbe;

/// Public live status as reported by the ingest server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub is_live: bool,
    pub listener_count: u32,
    pub peak_listener_count: u32,
}

/// Expensive "ask upstream for live status" call.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self) -> Result<UpstreamStatus>;
}

/// Health probe for a broadcast's source connection.
///
/// `Err` means the upstream could not be asked at all; the caller treats
/// that as an unreachable server.
#[async_trait]
pub trait SourceProbe: Send + Sync {
    async fn probe(&self, broadcast_id: &BroadcastId) -> Result<HealthProbe>;
}
