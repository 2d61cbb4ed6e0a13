//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use radio_relay::Result;
use radio_relay::collaborators::Collaborators;
use radio_relay::config::AppConfig;
use radio_relay::domain::BroadcastId;
use radio_relay::health::HealthProbe;
use radio_relay::relay::LaunchSpec;
use radio_relay::scheduler::Scheduler;
use radio_relay::services::{ServiceContainer, Upstream};
use radio_relay::upstream::{SourceProbe, StatusSource, UpstreamStatus};

pub fn down() -> HealthProbe {
    HealthProbe {
        server_reachable: true,
        mount_point_exists: true,
        has_active_source: false,
        bitrate: 0,
        within_grace_period: false,
    }
}

pub fn up() -> HealthProbe {
    HealthProbe {
        server_reachable: true,
        mount_point_exists: true,
        has_active_source: true,
        bitrate: 128,
        within_grace_period: false,
    }
}

/// Upstream fake that replays a script of probes, repeating the last one.
pub struct ScriptedUpstream {
    probes: Mutex<VecDeque<HealthProbe>>,
    pub probe_calls: AtomicU32,
    pub status: Mutex<UpstreamStatus>,
}

impl ScriptedUpstream {
    pub fn new(script: Vec<HealthProbe>) -> Arc<Self> {
        Arc::new(Self {
            probes: Mutex::new(script.into()),
            probe_calls: AtomicU32::new(0),
            status: Mutex::new(UpstreamStatus::default()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProbe for ScriptedUpstream {
    async fn probe(&self, _broadcast_id: &BroadcastId) -> Result<HealthProbe> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let mut probes = self.probes.lock();
        let probe = if probes.len() > 1 {
            probes.pop_front()
        } else {
            probes.front().copied()
        };
        Ok(probe.unwrap_or_else(down))
    }
}

#[async_trait]
impl StatusSource for ScriptedUpstream {
    async fn fetch_status(&self) -> Result<UpstreamStatus> {
        Ok(*self.status.lock())
    }
}

/// A container around `upstream` whose transcoder discards its input.
pub fn container(config: &AppConfig, upstream: Arc<ScriptedUpstream>) -> ServiceContainer {
    ServiceContainer::new(
        config,
        Upstream {
            status: upstream.clone(),
            probe: upstream,
        },
        LaunchSpec::new("sh", vec!["-c".into(), "cat > /dev/null".into()]),
        Collaborators::noop(),
        Scheduler::current(),
    )
}
