//! Framed byte transport
//!
//! Everything the relay sends rides in length-prefixed frames:
//!
//! ```text
//! +--------+--------+------------------+
//! |   Length (2B)   |      Body        |
//! +--------+--------+------------------+
//! ```
//!
//! A frame body is either plaintext or an AEAD-sealed ciphertext, depending
//! on how the reader/writer pair was constructed. Control channels use plain
//! framing; pipe connections are sealed when encryption is enabled.

mod framed;

pub use framed::{FrameReader, FrameWriter};

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Empty frame")]
    EmptyFrame,
}
