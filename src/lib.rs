//! # Burrow
//!
//! The server side of a reverse-tunnel relay. Clients behind NAT open a
//! long-lived **control channel** to the relay and ask it to expose local
//! services on public ports. Public traffic accepted on those ports is
//! carried back to the client over a small pool of persistent **pipe**
//! connections, each multiplexing many ephemeral streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Public accept loops                  │
//! │        (one TCP listener per exposed tunnel)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Control subsystem                   │
//! │    (handshake, pipe pool, liveness, lifecycle)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing layer                   │
//! │        (many streams over one pipe connection)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Framed transport                    │
//! │     (length-prefixed frames, optional AEAD seal)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod msg;
pub mod mux;
pub mod server;
pub mod transport;

pub(crate) mod shutdown;

pub use config::Config;
pub use server::Relay;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a single transport frame (64 KB - 1)
pub const MAX_FRAME_SIZE: usize = 65535;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Message error: {0}")]
    Msg(#[from] msg::MsgError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Multiplex error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Control error: {0}")]
    Control(#[from] control::ControlError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
