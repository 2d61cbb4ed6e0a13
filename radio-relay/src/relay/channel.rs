//! The broadcaster's inbound audio channel, abstracted from its transport.

use async_trait::async_trait;
use bytes::Bytes;

/// Close codes sent back on the inbound channel.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Close reasons sent back on the inbound channel.
pub mod close_reason {
    pub const ENDED: &str = "BROADCAST_ENDED";
    pub const SESSION_CONFLICT: &str = "SESSION_CONFLICT";
    pub const TRANSCODER_UNAVAILABLE: &str = "TRANSCODER_UNAVAILABLE";
    pub const AUDIO_PIPE_FAILED: &str = "AUDIO_PIPE_FAILED";
    pub const TRANSCODER_EXITED: &str = "TRANSCODER_EXITED";
}

/// One item read from the inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Audio(Bytes),
    /// The peer closed the channel or it was dropped.
    Closed,
    /// Transport-level failure; the channel is unusable.
    Error(String),
}

/// An ordered source of binary audio frames.
///
/// `recv` must be cancel safe: the relay supervisor polls it inside
/// `tokio::select!`.
#[async_trait]
pub trait InboundChannel: Send {
    async fn recv(&mut self) -> InboundFrame;

    /// Close with a diagnostic code. Called at most once per session.
    async fn close(&mut self, code: u16, reason: &str);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    /// In-memory inbound channel driven by an mpsc sender.
    pub struct TestChannel {
        rx: mpsc::Receiver<InboundFrame>,
        pub closed: Arc<Mutex<Option<(u16, String)>>>,
    }

    impl TestChannel {
        pub fn new() -> (mpsc::Sender<InboundFrame>, Self) {
            let (tx, rx) = mpsc::channel(64);
            (
                tx,
                Self {
                    rx,
                    closed: Arc::new(Mutex::new(None)),
                },
            )
        }
    }

    #[async_trait]
    impl InboundChannel for TestChannel {
        async fn recv(&mut self) -> InboundFrame {
            self.rx.recv().await.unwrap_or(InboundFrame::Closed)
        }

        async fn close(&mut self, code: u16, reason: &str) {
            *self.closed.lock() = Some((code, reason.to_string()));
        }
    }
}
