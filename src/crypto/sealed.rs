//! AEAD sealing for pipe frames
//!
//! AES-128-GCM with counter nonces. The two directions of a pipe share one
//! derived key, so the first nonce byte carries a direction tag to keep the
//! nonce spaces disjoint.

use super::{CryptoError, NONCE_LEN, PIPE_KEY_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

/// Direction tag for frames sent by the client
pub const DIR_CLIENT: u8 = 0x01;

/// Direction tag for frames sent by the server
pub const DIR_SERVER: u8 = 0x02;

fn make_key(key: &[u8; PIPE_KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_128_GCM, key).map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(LessSafeKey::new(unbound))
}

fn make_nonce(direction: u8, counter: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = direction;
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(nonce)
}

/// Sealing half of a pipe cipher
pub struct Sealer {
    key: LessSafeKey,
    direction: u8,
    nonce_counter: u64,
}

impl Sealer {
    /// Create a sealer for one direction of a pipe
    pub fn new(key: &[u8; PIPE_KEY_LEN], direction: u8) -> Result<Self, CryptoError> {
        Ok(Self {
            key: make_key(key)?,
            direction,
            nonce_counter: 0,
        })
    }

    /// Encrypt `buf` in place, appending the auth tag
    pub fn seal_in_place(&mut self, buf: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = make_nonce(self.direction, self.nonce_counter);
        self.nonce_counter += 1;

        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), buf)
            .map_err(|_| CryptoError::Encryption)
    }
}

/// Opening half of a pipe cipher
pub struct Opener {
    key: LessSafeKey,
    direction: u8,
    nonce_counter: u64,
}

impl Opener {
    /// Create an opener for the peer's direction of a pipe
    pub fn new(key: &[u8; PIPE_KEY_LEN], direction: u8) -> Result<Self, CryptoError> {
        Ok(Self {
            key: make_key(key)?,
            direction,
            nonce_counter: 0,
        })
    }

    /// Decrypt `buf` in place, verifying and stripping the auth tag
    ///
    /// Returns the plaintext slice.
    pub fn open_in_place<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        let nonce = make_nonce(self.direction, self.nonce_counter);
        self.nonce_counter += 1;

        self.key
            .open_in_place(nonce, Aad::empty(), buf)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; PIPE_KEY_LEN] = [0x42; PIPE_KEY_LEN];

    #[test]
    fn test_seal_open_roundtrip() {
        let mut sealer = Sealer::new(&KEY, DIR_SERVER).unwrap();
        let mut opener = Opener::new(&KEY, DIR_SERVER).unwrap();

        for round in 0..3u8 {
            let mut buf = vec![round; 13];
            sealer.seal_in_place(&mut buf).unwrap();
            let plaintext = opener.open_in_place(&mut buf).unwrap();
            assert_eq!(plaintext, vec![round; 13]);
        }
    }

    #[test]
    fn test_direction_separation() {
        let mut sealer = Sealer::new(&KEY, DIR_CLIENT).unwrap();
        let mut opener = Opener::new(&KEY, DIR_SERVER).unwrap();

        let mut buf = b"hello".to_vec();
        sealer.seal_in_place(&mut buf).unwrap();
        assert!(opener.open_in_place(&mut buf).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let mut sealer = Sealer::new(&KEY, DIR_SERVER).unwrap();
        let mut opener = Opener::new(&KEY, DIR_SERVER).unwrap();

        let mut buf = b"hello".to_vec();
        sealer.seal_in_place(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        assert!(opener.open_in_place(&mut buf).is_err());
    }
}
