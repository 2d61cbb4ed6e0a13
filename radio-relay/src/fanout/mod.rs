//! Real-time status fan-out to listener connections.

mod connection;
mod service;
mod snapshot;

pub use connection::{ListenerConnection, ListenerIdentity, StatusChannel};
pub use service::{CycleTrigger, FanoutConfig, FanoutOutcome, ListenerStatusFanout};
pub use snapshot::StatusSnapshot;
