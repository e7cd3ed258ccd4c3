//! Contract between a session and the byte transport underneath it.

use bytes::Bytes;

use crate::error::Result;

/// Transport connection state as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
    pub clean: bool,
}

impl CloseReason {
    pub fn clean(reason: impl Into<String>) -> Self {
        Self {
            code: 1000,
            reason: reason.into(),
            clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: 1006,
            reason: reason.into(),
            clean: false,
        }
    }
}

/// Notifications a transport delivers, one at a time, to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Chunk(Bytes),
    Error(String),
    Close(CloseReason),
}

/// A duplex byte transport.
///
/// Implementations must not block: `send` queues, and progress is reported
/// back through [`Transport::outstanding`] and [`TransportEvent`]s.
pub trait Transport {
    /// Start connecting to `uri`. `Open` or `Error`/`Close` follow as events.
    fn connect(&mut self, uri: &str) -> Result<()>;

    fn send(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self);

    /// Bytes accepted by `send` that have not been written out yet.
    fn outstanding(&self) -> usize;

    fn ready_state(&self) -> ReadyState;
}
