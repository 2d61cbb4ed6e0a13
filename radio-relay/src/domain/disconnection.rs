use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a live broadcast stopped delivering audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectionCategory {
    /// The broadcaster's own source went away (client crash, dropped uplink).
    SourceDisconnected,
    /// Ingest server or relay process is down. Needs an operator.
    ServerIssue,
    /// Source is connected but data is not flowing properly.
    NetworkIssue,
    /// Not enough evidence to decide.
    Unknown,
}

impl DisconnectionCategory {
    /// Whether the reconnection coordinator may act on this category.
    pub fn supports_automatic_recovery(&self) -> bool {
        matches!(self, Self::SourceDisconnected | Self::NetworkIssue)
    }

    /// Whether this category is only resolvable by an operator.
    pub fn requires_operator_intervention(&self) -> bool {
        matches!(self, Self::ServerIssue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceDisconnected => "SOURCE_DISCONNECTED",
            Self::ServerIssue => "SERVER_ISSUE",
            Self::NetworkIssue => "NETWORK_ISSUE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DisconnectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
