//! # Strand Crypto
//!
//! Cryptographic primitives for the Strand mesh overlay.
//!
//! This crate provides:
//! - `Noise_NN` handshake for the node to relay server transport
//! - `ChaCha20-Poly1305` tunnel cipher keyed from static X25519 keys
//! - RSA-signed node credentials checked by relay servers
//! - Secure random nonces
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Used by |
//! |----------|-----------|---------|
//! | Relay handshake | `Noise_NN_25519_ChaChaPoly_BLAKE2s` | relay client / session |
//! | Relay transport | ChaCha20-Poly1305 (explicit nonce) | relay client / session |
//! | Peer key agreement | X25519 | tunnels |
//! | Tunnel AEAD | ChaCha20-Poly1305 | tunnels |
//! | Credentials | RSA PKCS#1 v1.5 over SHA-256 | control plane / relay server |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod credential;
pub mod error;
pub mod noise;
pub mod random;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const CHACHA_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const CHACHA_NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;
