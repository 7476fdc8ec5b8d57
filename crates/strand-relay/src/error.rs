//! Error types for relay links, servers and clients.
//!
//! # Error Categories
//!
//! - **Protocol**: the peer violated the relay protocol (bad frame, message out
//!   of order, undecryptable payload). The connection is closed.
//! - **Transient**: network or back-pressure failures. The connection is
//!   closed (or the message dropped) and the manager reconnects on its next tick.
//! - **Authentication**: the credential was rejected during the handshake.

use strand_core::{CodecError, MessageKind, PeerId};
use strand_crypto::CryptoError;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    // ============ Transport Errors ============
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// The outbound queue is full
    #[error("send buffer exceeded")]
    SendBufferExceeded,

    /// The link is closed
    #[error("connection closed")]
    Closed,

    /// `close` was called on an already closed link
    #[error("connection already closed")]
    AlreadyClosed,

    /// The client has not been connected yet
    #[error("not connected")]
    NotConnected,

    // ============ Protocol Errors ============
    /// Frame could not be decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Payload could not be decoded
    #[error("message error: {0}")]
    Message(#[from] strand_core::Error),

    /// Encryption, decryption or handshake failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Message kind not allowed in the current state
    #[error("unexpected message {0:?} in current state")]
    UnexpectedMessage(MessageKind),

    /// No callback registered for the message kind
    #[error("no handler for message {0:?}")]
    UnhandledMessage(MessageKind),

    /// Established link without a transport cipher
    #[error("transport cipher missing")]
    MissingCipher,

    // ============ State Errors ============
    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The credential was rejected
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// No session for the peer
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),
}

impl RelayError {
    /// Returns true if the peer violated the protocol and the connection
    /// must be closed.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RelayError::Codec(_)
                | RelayError::Message(_)
                | RelayError::Crypto(_)
                | RelayError::UnexpectedMessage(_)
                | RelayError::UnhandledMessage(_)
                | RelayError::MissingCipher
        )
    }

    /// Returns true if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::Timeout
                | RelayError::SendBufferExceeded
                | RelayError::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RelayError::UnhandledMessage(MessageKind::Forward).is_protocol());
        assert!(RelayError::MissingCipher.is_protocol());
        assert!(!RelayError::SendBufferExceeded.is_protocol());
        assert!(RelayError::SendBufferExceeded.is_transient());
        assert!(RelayError::Timeout.is_transient());
        assert!(!RelayError::Unauthenticated("expired".into()).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RelayError::SendBufferExceeded.to_string(),
            "send buffer exceeded"
        );
        assert_eq!(
            RelayError::PeerNotFound(PeerId(7)).to_string(),
            "peer not found: 7"
        );
    }
}
