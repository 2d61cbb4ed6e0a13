//! Live audio relay and stream-resilience core for an internet radio station.
//!
//! A broadcaster streams encoded audio over a WebSocket; the [`relay`]
//! pipes it through an external transcoder into the ingest server. The
//! [`health`] monitor classifies disconnections, the [`reconnection`]
//! coordinator recovers the recoverable ones with bounded backoff, and the
//! [`fanout`] pushes one cached status snapshot to every listener.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod fanout;
pub mod health;
pub mod logging;
pub mod reconnection;
pub mod relay;
pub mod resilience;
pub mod scheduler;
pub mod services;
pub mod status;
pub mod upstream;

pub use error::{Error, Result};
