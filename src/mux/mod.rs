//! Stream multiplexing over pipe connections
//!
//! A pipe carries one [`MuxSession`]; each public connection is mapped onto
//! an ephemeral [`MuxStream`] within a session. The relay side is the
//! stream opener; the tunnel client accepts streams and connects them to
//! the local service.

mod frame;
mod session;
mod stream;

pub use frame::{Frame, FrameType, MAX_DATA_LEN, MUX_HEADER_SIZE};
pub use session::{MuxConfig, MuxSession};
pub use stream::{MuxStream, MuxStreamReader, MuxStreamWriter};

use thiserror::Error;

/// Default bound on buffered inbound data per session (4 MiB)
pub const DEFAULT_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;

/// Multiplexing errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}
