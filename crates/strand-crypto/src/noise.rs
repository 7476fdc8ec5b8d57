//! Noise_NN handshake for the relay transport.
//!
//! The relay link runs a single round trip of
//! `Noise_NN_25519_ChaChaPoly_BLAKE2s`:
//!
//! ```text
//! node (initiator)                       relay server (responder)
//!   -> e            payload: credential
//!                                        <- e, ee   payload: heartbeat interval
//! ```
//!
//! Authentication of the node comes from the credential carried in the
//! first payload, not from Noise static keys. After the round trip both
//! sides switch to a stateless transport whose nonces are chosen by the
//! caller and carried in every frame header.

use crate::CryptoError;

/// Noise protocol name used by relay links.
pub const NOISE_PATTERN: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message (payload plus overhead).
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// Noise handshake overhead added to the payload of each message (ephemeral
/// key plus an optional tag).
const HANDSHAKE_OVERHEAD: usize = 32 + crate::TAG_SIZE;

/// Which side of the handshake this state plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The node dialing the relay server
    Initiator,
    /// The relay server accepting the connection
    Responder,
}

/// In-progress Noise_NN handshake.
pub struct NoiseHandshake {
    state: snow::HandshakeState,
    role: Role,
}

impl NoiseHandshake {
    /// Create a handshake as the initiator.
    ///
    /// # Errors
    ///
    /// Returns an error if the Noise parameters cannot be built.
    pub fn initiator() -> Result<Self, CryptoError> {
        Self::new(Role::Initiator)
    }

    /// Create a handshake as the responder.
    ///
    /// # Errors
    ///
    /// Returns an error if the Noise parameters cannot be built.
    pub fn responder() -> Result<Self, CryptoError> {
        Self::new(Role::Responder)
    }

    fn new(role: Role) -> Result<Self, CryptoError> {
        let params: snow::params::NoiseParams = NOISE_PATTERN.parse()?;
        let builder = snow::Builder::new(params);
        let state = match role {
            Role::Initiator => builder.build_initiator()?,
            Role::Responder => builder.build_responder()?,
        };
        Ok(Self { state, role })
    }

    /// Role of this handshake.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Produce the next handshake message carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if it is not our turn to write or the payload is too large.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() + HANDSHAKE_OVERHEAD > MAX_NOISE_MESSAGE {
            return Err(CryptoError::Handshake("payload too large".into()));
        }
        let mut buf = vec![0u8; payload.len() + HANDSHAKE_OVERHEAD];
        let len = self.state.write_message(payload, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the peer's handshake message and return its payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed or out of turn.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; message.len()];
        let len = self.state.read_message(message, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Whether both handshake messages have been processed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Switch to transport mode.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if the handshake is not finished.
    pub fn into_transport(self) -> Result<TransportCipher, CryptoError> {
        if !self.state.is_handshake_finished() {
            return Err(CryptoError::InvalidState);
        }
        let state = self.state.into_stateless_transport_mode()?;
        Ok(TransportCipher { state })
    }
}

impl std::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("role", &self.role)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Transport cipher produced by a finished handshake.
///
/// Nonces are supplied by the caller so frames can be decrypted regardless
/// of arrival order.
pub struct TransportCipher {
    state: snow::StatelessTransportState,
}

impl TransportCipher {
    /// Encrypt an outbound message under `nonce`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the message is too large.
    pub fn encrypt(&self, nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() + crate::TAG_SIZE > MAX_NOISE_MESSAGE {
            return Err(CryptoError::EncryptionFailed);
        }
        let mut buf = vec![0u8; plaintext.len() + crate::TAG_SIZE];
        let len = self
            .state
            .write_message(nonce, plaintext, &mut buf)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Decrypt an inbound message under `nonce`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    pub fn decrypt(&self, nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < crate::TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(nonce, ciphertext, &mut buf)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        buf.truncate(len);
        Ok(buf)
    }
}

impl std::fmt::Debug for TransportCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportCipher")
    }
}
