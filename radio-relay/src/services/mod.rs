//! Service layer: construction and lifecycle of the relay core.

pub mod container;

pub use container::{ServiceContainer, ServiceStats, Upstream};
