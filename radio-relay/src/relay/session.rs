//! One live relay session: transcoder spawn, diagnostic monitor and the
//! supervisor loop that pumps audio into the transcoder.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use process_utils::{shutdown_child, tokio_command};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::channel::{InboundChannel, InboundFrame, close_code, close_reason};
use super::config::{LaunchSpec, SessionTimings};
use super::diagnostics::{RelaySignal, classify_line};
use crate::domain::BroadcastId;
use crate::{Error, Result};

/// Live state of a running relay session, shared with the registry.
#[derive(Debug)]
pub struct RelayHandle {
    pub broadcast_id: BroadcastId,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    running: AtomicBool,
    connected: AtomicBool,
    bytes_relayed: AtomicU64,
    encoded_bitrate_kbps: AtomicU32,
    last_signal: Mutex<Option<RelaySignal>>,
    token: CancellationToken,
}

impl RelayHandle {
    pub(crate) fn new(broadcast_id: BroadcastId) -> Self {
        Self {
            broadcast_id,
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            bytes_relayed: AtomicU64::new(0),
            encoded_bitrate_kbps: AtomicU32::new(0),
            last_signal: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// Transcoder process is up.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The transcoder has reported a connection to the ingest server.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn last_signal(&self) -> Option<RelaySignal> {
        *self.last_signal.lock()
    }

    /// Ask the session to end. The supervisor tears down and reports.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            broadcast_id: self.broadcast_id.clone(),
            session_id: self.session_id,
            started_at: self.started_at,
            running: self.is_running(),
            connected: self.is_connected(),
            bytes_relayed: self.bytes_relayed(),
            encoded_bitrate_kbps: self.encoded_bitrate_kbps.load(Ordering::Relaxed),
            last_signal: self.last_signal(),
        }
    }

    fn record_signal(&self, signal: RelaySignal) {
        if signal == RelaySignal::Connected {
            if !self.connected.swap(true, Ordering::AcqRel) {
                info!(broadcast_id = %self.broadcast_id, "Transcoder connected to ingest");
            }
        } else {
            warn!(broadcast_id = %self.broadcast_id, %signal, "Transcoder reported a failure");
        }
        *self.last_signal.lock() = Some(signal);
    }
}

/// Serializable view of a [`RelayHandle`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub broadcast_id: BroadcastId,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    pub connected: bool,
    pub bytes_relayed: u64,
    pub encoded_bitrate_kbps: u32,
    pub last_signal: Option<RelaySignal>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The broadcaster closed the channel.
    ChannelClosed,
    /// Stopped through the registry.
    Stopped,
    ChannelError(String),
    /// Writing audio to the transcoder failed.
    PipeFailed(String),
    /// The transcoder exited while the session was live.
    TranscoderExited(Option<i32>),
}

impl SessionEnd {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::ChannelClosed | Self::Stopped)
    }

    pub(crate) fn close_frame(&self) -> (u16, &'static str) {
        match self {
            Self::ChannelClosed | Self::Stopped | Self::ChannelError(_) => {
                (close_code::NORMAL, close_reason::ENDED)
            }
            Self::PipeFailed(_) => (close_code::INTERNAL_ERROR, close_reason::AUDIO_PIPE_FAILED),
            Self::TranscoderExited(_) => {
                (close_code::INTERNAL_ERROR, close_reason::TRANSCODER_EXITED)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::ChannelClosed => "broadcaster closed the channel".to_string(),
            Self::Stopped => "stopped by operator".to_string(),
            Self::ChannelError(e) => format!("inbound channel error: {}", e),
            Self::PipeFailed(e) => format!("audio pipe failed: {}", e),
            Self::TranscoderExited(Some(code)) => format!("transcoder exited with code {}", code),
            Self::TranscoderExited(None) => "transcoder terminated by signal".to_string(),
        }
    }
}

/// Summary returned when a session finishes.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub end: SessionEnd,
    pub bytes_relayed: u64,
    pub connected: bool,
    pub last_signal: Option<RelaySignal>,
}

/// Spawn the transcoder, retrying a bounded number of times.
pub(crate) async fn spawn_transcoder(spec: &LaunchSpec, timings: &SessionTimings) -> Result<Child> {
    let mut last_error = String::new();

    for attempt in 1..=timings.spawn_attempts {
        debug!(attempt, command = %spec.display(), "Spawning transcoder");
        let spawned = tokio_command(&spec.program)
            .args(&spec.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        match spawned {
            Ok(child) => return Ok(child),
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = timings.spawn_attempts,
                    error = %e,
                    "Failed to spawn transcoder"
                );
                last_error = e.to_string();
                if attempt < timings.spawn_attempts {
                    tokio::time::sleep(timings.spawn_retry_pause).await;
                }
            }
        }
    }

    Err(Error::TranscoderSpawn {
        attempts: timings.spawn_attempts,
        message: last_error,
    })
}

/// Reads transcoder stderr and forwards classified lines to the supervisor.
struct DiagnosticMonitor {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
enum MonitorEvent {
    Signal(RelaySignal),
    Bitrate(f64),
}

impl DiagnosticMonitor {
    fn spawn(stderr: ChildStderr, spec: &LaunchSpec, broadcast_id: BroadcastId) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let spec = spec.clone();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            trace!(%broadcast_id, line = %spec.redact(&line), "transcoder");
                            let parsed = classify_line(&line);
                            if let Some(signal) = parsed.signal {
                                if signal.is_failure() {
                                    debug!(%broadcast_id, line = %spec.redact(&line), "Transcoder diagnostic");
                                }
                                if tx.send(MonitorEvent::Signal(signal)).await.is_err() {
                                    break;
                                }
                            }
                            if let Some(kbps) = parsed.bitrate_kbps {
                                let _ = tx.try_send(MonitorEvent::Bitrate(kbps));
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(%broadcast_id, error = %e, "Transcoder stderr read failed");
                            break;
                        }
                    }
                }
            }
        });

        (Self { token, task }, rx)
    }

    /// Signal the reader and wait for it, aborting after `timeout`.
    async fn stop(self, timeout: std::time::Duration) {
        self.token.cancel();
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("Diagnostic monitor did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Drive one session until it ends, then tear the transcoder down.
///
/// The channel is closed with the matching code before returning.
pub(crate) async fn run_session(
    handle: &RelayHandle,
    mut child: Child,
    spec: &LaunchSpec,
    timings: &SessionTimings,
    channel: &mut dyn InboundChannel,
) -> SessionReport {
    let broadcast_id = handle.broadcast_id.clone();
    handle.running.store(true, Ordering::Release);

    let stdin = child.stdin.take();
    let stderr = child.stderr.take();
    let (monitor, mut events) = match stderr {
        Some(stderr) => {
            let (monitor, rx) = DiagnosticMonitor::spawn(stderr, spec, broadcast_id.clone());
            (Some(monitor), rx)
        }
        None => (None, mpsc::channel(1).1),
    };

    let (end, stdin) = match stdin {
        Some(mut stdin) => {
            let end = supervise(handle, &mut child, &mut stdin, channel, &mut events).await;
            (end, Some(stdin))
        }
        None => (SessionEnd::PipeFailed("transcoder stdin not captured".to_string()), None),
    };

    info!(%broadcast_id, reason = %end.describe(), "Relay session ending");

    if let Some(monitor) = monitor {
        monitor.stop(timings.monitor_join_timeout).await;
    }
    match shutdown_child(&mut child, stdin, timings.shutdown_timeout).await {
        Ok(outcome) if outcome.was_killed() => {
            warn!(%broadcast_id, "Transcoder did not exit in time, killed")
        }
        Ok(outcome) => debug!(%broadcast_id, ?outcome, "Transcoder exited"),
        Err(e) => warn!(%broadcast_id, error = %e, "Transcoder shutdown failed"),
    }
    handle.running.store(false, Ordering::Release);

    let (code, reason) = end.close_frame();
    channel.close(code, reason).await;

    SessionReport {
        session_id: handle.session_id,
        end,
        bytes_relayed: handle.bytes_relayed(),
        connected: handle.is_connected(),
        last_signal: handle.last_signal(),
    }
}

async fn supervise(
    handle: &RelayHandle,
    child: &mut Child,
    stdin: &mut ChildStdin,
    channel: &mut dyn InboundChannel,
    events: &mut mpsc::Receiver<MonitorEvent>,
) -> SessionEnd {
    loop {
        tokio::select! {
            biased;

            _ = handle.token.cancelled() => return SessionEnd::Stopped,

            Some(event) = events.recv() => match event {
                MonitorEvent::Signal(signal) => handle.record_signal(signal),
                MonitorEvent::Bitrate(kbps) => {
                    handle.encoded_bitrate_kbps.store(kbps.round() as u32, Ordering::Relaxed);
                }
            },

            status = child.wait() => {
                return SessionEnd::TranscoderExited(status.ok().and_then(|s| s.code()));
            }

            frame = channel.recv() => match frame {
                InboundFrame::Audio(chunk) => {
                    // A transcoder that stops reading fills the pipe; stop and
                    // exit must still win over the pending write.
                    tokio::select! {
                        biased;

                        _ = handle.token.cancelled() => return SessionEnd::Stopped,

                        status = child.wait() => {
                            return SessionEnd::TranscoderExited(status.ok().and_then(|s| s.code()));
                        }

                        written = stdin.write_all(&chunk) => {
                            if let Err(e) = written {
                                return SessionEnd::PipeFailed(e.to_string());
                            }
                        }
                    }
                    handle.bytes_relayed.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                InboundFrame::Closed => return SessionEnd::ChannelClosed,
                InboundFrame::Error(e) => return SessionEnd::ChannelError(e),
            },
        }
    }
}
