//! rfbsock: binary message buffering between a chunked byte transport and a
//! remote framebuffer protocol decoder.
//!
//! The crate provides:
//! - A growable receive queue with typed big-endian reads and backtracking
//! - A fixed-size send queue flushed under transport backpressure
//! - A session state machine that drives a decoder through typed events
//! - A tokio TCP transport and an async event loop to run a session on it
#![warn(
    missing_debug_implementations,
    redundant_lifetimes,
    non_local_definitions,
    unsafe_code
)]

pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod recv;
pub mod send;
pub mod session;
pub mod tcp;
pub mod transport;

pub use config::SessionConfig;
pub use driver::drive;
pub use error::{Result, RfbError};
pub use recv::ReceiveBuffer;
pub use send::SendBuffer;
pub use session::{SessionEvent, SessionHandler, SessionState, SessionStats, TransportSession};
pub use tcp::TcpTransport;
pub use transport::{CloseReason, ReadyState, Transport, TransportEvent};
