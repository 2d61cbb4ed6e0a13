//! Stream health classification.
//!
//! Turns raw health signals into a [`DisconnectionCategory`]. The rules are
//! evaluated in order and the first match wins; anything ambiguous falls
//! through to `Unknown`, which never triggers automatic recovery.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::DisconnectionCategory;

/// Structured result of one upstream health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    pub server_reachable: bool,
    pub mount_point_exists: bool,
    pub has_active_source: bool,
    /// Current source bitrate in kbps, 0 if unknown or absent.
    pub bitrate: u32,
    /// The broadcast started recently enough that a missing source is expected.
    pub within_grace_period: bool,
}

impl HealthProbe {
    /// Probe result for an upstream that could not be reached at all.
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Whether audio is flowing again for the probed mount.
    pub fn is_source_restored(&self) -> bool {
        self.has_active_source && self.bitrate > 0
    }
}

/// Every input the classifier looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSignals {
    pub backend_reachable: bool,
    pub relay_process_running: bool,
    pub mount_exists: bool,
    pub has_active_source: bool,
    pub bitrate: u32,
    pub within_grace_period: bool,
}

impl HealthSignals {
    /// Combine an upstream probe with the local relay state.
    pub fn from_probe(probe: &HealthProbe, relay_process_running: bool) -> Self {
        Self {
            backend_reachable: probe.server_reachable,
            relay_process_running,
            mount_exists: probe.mount_point_exists,
            has_active_source: probe.has_active_source,
            bitrate: probe.bitrate,
            within_grace_period: probe.within_grace_period,
        }
    }
}

/// Classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// When false every classification is `Unknown`.
    pub enabled: bool,
    /// Bitrates below this (kbps, exclusive) on a connected source count as a network issue.
    pub low_bitrate_threshold_kbps: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_bitrate_threshold_kbps: 32,
        }
    }
}

/// Pure decision function over [`HealthSignals`].
#[derive(Debug, Clone, Default)]
pub struct StreamHealthClassifier {
    config: ClassifierConfig,
}

impl StreamHealthClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, signals: &HealthSignals) -> DisconnectionCategory {
        if !self.config.enabled {
            return DisconnectionCategory::Unknown;
        }

        let category = classify_signals(signals, self.config.low_bitrate_threshold_kbps);
        debug!(?signals, %category, "Classified stream health");
        category
    }
}

fn classify_signals(s: &HealthSignals, low_bitrate_threshold: u32) -> DisconnectionCategory {
    if !s.relay_process_running || !s.backend_reachable {
        return DisconnectionCategory::ServerIssue;
    }

    if s.mount_exists && !s.has_active_source {
        return DisconnectionCategory::SourceDisconnected;
    }

    if !s.mount_exists && s.within_grace_period {
        return DisconnectionCategory::Unknown;
    }

    if !s.mount_exists && s.bitrate == 0 {
        return DisconnectionCategory::SourceDisconnected;
    }

    if s.has_active_source && s.bitrate == 0 {
        return DisconnectionCategory::NetworkIssue;
    }

    if s.has_active_source && s.bitrate < low_bitrate_threshold {
        return DisconnectionCategory::NetworkIssue;
    }

    DisconnectionCategory::Unknown
}
