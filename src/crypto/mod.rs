//! Cryptographic primitives for the relay
//!
//! This module provides:
//! - Ephemeral X25519 key exchange for the control handshake
//! - TLS-1.2-style PRF for deriving per-pipe session keys
//! - AES-128-GCM sealing for pipe frames
//! - Client identifier generation
//! - Secure random number generation

mod kdf;
mod keys;
mod sealed;

pub use kdf::{derive_pipe_key, prf12};
pub use keys::{generate_key_exchange, process_key_exchange, ClientId, ExchangePrivate};
pub use sealed::{Opener, Sealer, DIR_CLIENT, DIR_SERVER};

use thiserror::Error;

/// Length of a derived pipe session key in bytes (AES-128)
pub const PIPE_KEY_LEN: usize = 16;

/// Length of an AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of an AEAD authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of a client identifier in bytes
pub const CLIENT_ID_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed")]
    KeyGeneration,

    #[error("Key exchange failed")]
    KeyExchange,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed")]
    AuthenticationFailed,
}

/// Fill `buf` from the system CSPRNG
pub(crate) fn fill_random(buf: &mut [u8]) {
    let rng = ring::rand::SystemRandom::new();
    ring::rand::SecureRandom::fill(&rng, buf).expect("system CSPRNG unavailable");
}

/// Draw the random `once` value for one pipe hello
///
/// Each pipe carries a fresh nonce so its derived session key is unique
/// even under the same pre-master secret.
pub fn pipe_nonce() -> [u8; 16] {
    let mut once = [0u8; 16];
    fill_random(&mut once);
    once
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_nonces_are_fresh() {
        assert_ne!(pipe_nonce(), pipe_nonce());
    }
}
