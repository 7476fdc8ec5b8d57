//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid public key (low order point or bad encoding)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Noise handshake error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Operation not valid in the current handshake state
    #[error("invalid state for operation")]
    InvalidState,

    /// Credential bytes are structurally invalid
    #[error("malformed credential: {0}")]
    MalformedCredential(&'static str),

    /// Credential signature does not match
    #[error("invalid signature")]
    InvalidSignature,

    /// Credential expiry is in the past
    #[error("credential expired at {expired_at}")]
    CredentialExpired {
        /// Expiry as unix seconds
        expired_at: u64,
    },

    /// Signing key could not be used or decoded
    #[error("signing key error: {0}")]
    SigningKey(String),

    /// Base64 or other text encoding error
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<snow::Error> for CryptoError {
    fn from(e: snow::Error) -> Self {
        CryptoError::Handshake(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::Encoding(e.to_string())
    }
}

impl From<rsa::Error> for CryptoError {
    fn from(e: rsa::Error) -> Self {
        CryptoError::SigningKey(e.to_string())
    }
}
