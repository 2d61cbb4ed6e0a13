use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier scoping all per-broadcast state.
///
/// Relay sessions, reconnection attempts and health reports are all keyed by
/// this value; two concurrent relays never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(String);

impl BroadcastId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for BroadcastId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for BroadcastId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BroadcastId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
