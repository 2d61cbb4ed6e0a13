//! Bounded automatic recovery for broadcasts that lost their source.
//!
//! One [`ReconnectionCoordinator`] tracks every broadcast under recovery.
//! A broadcast is either idle (absent from the coordinator) or has exactly
//! one active [`ReconnectionAttempt`], driven by a single cancellable task
//! that waits out the backoff, probes the upstream and publishes
//! [`ReconnectionEvent`]s.

mod attempt;
mod config;
mod coordinator;
mod events;

pub use attempt::ReconnectionAttempt;
pub use config::ReconnectionConfig;
pub use coordinator::ReconnectionCoordinator;
pub use events::{ReconnectionEvent, ReconnectionStatus, Topic, TopicSubscription};
