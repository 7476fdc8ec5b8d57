//! Tunnel AEAD.
//!
//! Peer tunnels encrypt IP packets with `ChaCha20-Poly1305` keyed on the raw
//! X25519 shared secret of both static keys. The same key is used in both
//! directions; uniqueness comes from the per-packet random nonce carried in
//! the frame header.
//!
//! ## Nonce layout
//!
//! The 12-byte AEAD nonce follows the Noise convention: four zero bytes
//! followed by the 64-bit counter in little-endian order.
//!
//! ```text
//! +---------+-------------------------+
//! | 0 0 0 0 |  counter (u64, LE)      |
//! +---------+-------------------------+
//! ```

use crate::CryptoError;
use crate::x25519::{PrivateKey, PublicKey};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use zeroize::Zeroize;

/// Expand a 64-bit counter into a ChaCha20-Poly1305 nonce.
#[must_use]
pub fn nonce_from_counter(counter: u64) -> [u8; crate::CHACHA_NONCE_SIZE] {
    let mut bytes = [0u8; crate::CHACHA_NONCE_SIZE];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    bytes
}

/// Symmetric cipher shared by the two ends of a peer tunnel.
#[derive(Clone)]
pub struct TunnelCipher {
    cipher: ChaCha20Poly1305,
}

impl TunnelCipher {
    /// Create a cipher from a raw 32-byte key.
    #[must_use]
    pub fn new(key: &[u8; crate::CHACHA_KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Derive the tunnel cipher from the local static key and the peer's
    /// static public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the exchange yields a
    /// non-contributory (all-zero) secret.
    pub fn derive(local: &PrivateKey, remote: &PublicKey) -> Result<Self, CryptoError> {
        let shared = local
            .exchange(remote)
            .ok_or(CryptoError::InvalidPublicKey)?;
        let mut key = *shared.as_bytes();
        let cipher = Self::new(&key);
        key.zeroize();
        Ok(cipher)
    }

    /// Encrypt `plaintext` under `counter`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_from_counter(counter);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate `ciphertext` under `counter`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    pub fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_from_counter(counter);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for TunnelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelCipher")
    }
}
