//! Core value types shared by the relay, health and fan-out subsystems.

mod broadcast_id;
mod disconnection;

pub use broadcast_id::BroadcastId;
pub use disconnection::DisconnectionCategory;
