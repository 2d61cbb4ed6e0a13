//! Live audio relay: broadcaster channel → transcoder → ingest mount.

mod channel;
mod config;
mod diagnostics;
mod registry;
mod session;

pub use channel::{InboundChannel, InboundFrame, close_code, close_reason};
pub use config::{IngestConfig, LaunchSpec, SessionTimings, TranscoderConfig};
pub use diagnostics::{DiagnosticLine, RelaySignal, classify_line, parse_bitrate_kbps};
pub use registry::{RelayEvent, RelayRegistry};
pub use session::{RelayHandle, RelayStatus, SessionEnd, SessionReport};
