//! Stream health: classification of probe results and the periodic monitor
//! that feeds recoverable disconnections to the reconnection coordinator.

mod classifier;
mod monitor;

pub use classifier::{ClassifierConfig, HealthProbe, HealthSignals, StreamHealthClassifier};
pub use monitor::{HealthMonitor, HealthMonitorConfig, HealthReport};
