use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use super::{SourceProbe, StatusSource, UpstreamStatus};
use crate::domain::BroadcastId;
use crate::health::HealthProbe;
use crate::{Error, Result};

/// Status of one mount point extracted from Icecast's status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountStatus {
    pub mount_exists: bool,
    pub has_active_source: bool,
    /// kbps
    pub bitrate: u32,
    pub listeners: u32,
    pub listener_peak: u32,
}

impl MountStatus {
    fn to_probe(self) -> HealthProbe {
        HealthProbe {
            server_reachable: true,
            mount_point_exists: self.mount_exists,
            has_active_source: self.has_active_source,
            bitrate: self.bitrate,
            within_grace_period: false,
        }
    }

    fn to_status(self) -> UpstreamStatus {
        UpstreamStatus {
            is_live: self.mount_exists && self.has_active_source,
            listener_count: self.listeners,
            peak_listener_count: self.listener_peak.max(self.listeners),
        }
    }
}

/// Extract the status of `mount` from a `status-json.xsl` document.
///
/// Icecast renders `source` as an object when one mount is active and as an
/// array when several are; both shapes are accepted.
pub fn parse_mount_status(doc: &Value, mount: &str) -> MountStatus {
    let sources: Vec<&Value> = match doc.pointer("/icestats/source") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };

    let Some(source) = sources.into_iter().find(|s| source_matches(s, mount)) else {
        return MountStatus::default();
    };

    let bitrate = source_bitrate(source);
    let started = source
        .get("stream_start")
        .or_else(|| source.get("stream_start_iso8601"))
        .is_some_and(|v| !v.is_null());

    MountStatus {
        mount_exists: true,
        has_active_source: started || bitrate > 0,
        bitrate,
        listeners: number_field(source, "listeners").unwrap_or(0),
        listener_peak: number_field(source, "listener_peak").unwrap_or(0),
    }
}

fn source_matches(source: &Value, mount: &str) -> bool {
    let Some(listen_url) = source.get("listenurl").and_then(Value::as_str) else {
        return false;
    };
    match Url::parse(listen_url) {
        Ok(url) => url.path() == mount,
        Err(_) => listen_url.ends_with(mount),
    }
}

fn source_bitrate(source: &Value) -> u32 {
    if let Some(kbps) = number_field(source, "bitrate").filter(|b| *b > 0) {
        return kbps;
    }
    if let Some(bps) = number_field(source, "audio_bitrate").filter(|b| *b > 0) {
        return bps / 1000;
    }
    number_field(source, "ice-bitrate").unwrap_or(0)
}

/// Icecast emits numbers as JSON numbers or quoted strings depending on version.
fn number_field(source: &Value, key: &str) -> Option<u32> {
    match source.get(key)? {
        Value::Number(n) => n.as_u64().map(|v| v.min(u32::MAX as u64) as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Client for an Icecast server's JSON status endpoint.
pub struct IcecastClient {
    client: Client,
    status_url: Url,
    mount: String,
}

impl IcecastClient {
    pub fn new(status_url: &str, mount: impl Into<String>, timeout: Duration) -> Result<Self> {
        let status_url = Url::parse(status_url)
            .map_err(|e| Error::config(format!("Invalid Icecast status URL: {}", e)))?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            status_url,
            mount: mount.into(),
        })
    }

    async fn fetch_mount_status(&self) -> Result<MountStatus> {
        let response = self.client.get(self.status_url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "Icecast status returned {}",
                response.status()
            )));
        }

        let doc: Value = response.json().await?;
        let status = parse_mount_status(&doc, &self.mount);
        trace!(mount = %self.mount, ?status, "Fetched Icecast mount status");
        Ok(status)
    }
}

#[async_trait]
impl StatusSource for IcecastClient {
    async fn fetch_status(&self) -> Result<UpstreamStatus> {
        Ok(self.fetch_mount_status().await?.to_status())
    }
}

#[async_trait]
impl SourceProbe for IcecastClient {
    async fn probe(&self, broadcast_id: &BroadcastId) -> Result<HealthProbe> {
        let probe = self.fetch_mount_status().await?.to_probe();
        debug!(%broadcast_id, ?probe, "Probed source health");
        Ok(probe)
    }
}
