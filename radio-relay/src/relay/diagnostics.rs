//! Transcoder diagnostic output parsing.
//!
//! ffmpeg reports connection state only through free-form stderr lines.
//! Each line is mapped to at most one [`RelaySignal`]; progress lines also
//! carry an encoded-bitrate sample.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured meaning of a transcoder diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelaySignal {
    Connected,
    AuthRejected,
    NetworkError,
    HostUnresolved,
    ProtocolError,
}

impl RelaySignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::AuthRejected => "AUTH_REJECTED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::HostUnresolved => "HOST_UNRESOLVED",
            Self::ProtocolError => "PROTOCOL_ERROR",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Connected)
    }
}

impl fmt::Display for RelaySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const AUTH_PATTERNS: &[&str] = &["401", "403", "Unauthorized", "Forbidden"];
const NETWORK_PATTERNS: &[&str] = &[
    "Connection refused",
    "Connection reset",
    "timed out",
    "Broken pipe",
    "Network is unreachable",
];
const HOST_PATTERNS: &[&str] = &[
    "Name or service not known",
    "Failed to resolve",
    "nodename nor servname",
];
const PROTOCOL_PATTERNS: &[&str] = &[
    "Invalid data found",
    "Protocol not found",
    "Error number -",
    "Invalid argument",
];

/// One parsed diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DiagnosticLine {
    pub signal: Option<RelaySignal>,
    /// Encoded output bitrate in kbps, from progress lines.
    pub bitrate_kbps: Option<f64>,
}

/// Classify a single stderr line.
///
/// Progress lines are recognised first since their numeric fields can
/// collide with status codes. Failure patterns are then checked before the
/// output banner, so an error line that mentions the output is never read
/// as a connect.
pub fn classify_line(line: &str) -> DiagnosticLine {
    let bitrate_kbps = parse_bitrate_kbps(line);

    let signal = if is_progress(line) {
        Some(RelaySignal::Connected)
    } else if contains_any(line, AUTH_PATTERNS) {
        Some(RelaySignal::AuthRejected)
    } else if contains_any(line, NETWORK_PATTERNS) {
        Some(RelaySignal::NetworkError)
    } else if contains_any(line, HOST_PATTERNS) {
        Some(RelaySignal::HostUnresolved)
    } else if contains_any(line, PROTOCOL_PATTERNS) {
        Some(RelaySignal::ProtocolError)
    } else if is_output_opened(line) {
        Some(RelaySignal::Connected)
    } else {
        None
    };

    DiagnosticLine {
        signal,
        bitrate_kbps,
    }
}

fn contains_any(line: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| line.contains(p))
}

fn is_output_opened(line: &str) -> bool {
    line.contains("Output #0") && line.contains("icecast://")
}

/// `size=... time=... bitrate=...`
fn is_progress(line: &str) -> bool {
    line.contains("time=") && (line.contains("size=") || line.contains("frame="))
}

/// Parse `bitrate= 128.0kbits/s`. `bitrate=N/A` yields `None`.
pub fn parse_bitrate_kbps(line: &str) -> Option<f64> {
    let start = line.find("bitrate=")?;
    let rest = &line[start + 8..];
    let end = rest.find("kbits/s")?;
    rest[..end].trim().parse().ok()
}
