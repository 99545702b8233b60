//! Client identifiers and ephemeral key exchange

use super::{CryptoError, CLIENT_ID_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 128-bit client identifier, assigned at handshake
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        let mut bytes = [0u8; CLIENT_ID_LEN];
        super::fill_random(&mut bytes);
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Server-held private half of an in-flight key exchange
pub struct ExchangePrivate(EphemeralPrivateKey);

/// Generate an ephemeral X25519 key pair
///
/// Returns the private half and the public value to send to the peer.
pub fn generate_key_exchange() -> Result<(ExchangePrivate, Vec<u8>), CryptoError> {
    let rng = SystemRandom::new();
    let private =
        EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| CryptoError::KeyGeneration)?;
    let public = private
        .compute_public_key()
        .map_err(|_| CryptoError::KeyGeneration)?;

    let public_bytes = public.as_ref().to_vec();
    Ok((ExchangePrivate(private), public_bytes))
}

/// Complete the key exchange against the peer's public value
///
/// Consumes the private half and returns the shared pre-master secret.
pub fn process_key_exchange(
    private: ExchangePrivate,
    peer_public: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let peer = UnparsedPublicKey::new(&X25519, peer_public);
    agreement::agree_ephemeral(private.0, &peer, |secret| secret.to_vec())
        .map_err(|_| CryptoError::KeyExchange)
}
