//! Error types for the Strand core protocol.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Framing error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Payload (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Message kind does not match the payload
    #[error("unexpected message kind: {0:?}")]
    UnexpectedKind(crate::MessageKind),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Frame-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Payload size exceeds the protocol maximum
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Declared or actual payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Unknown message kind code
    #[error("unknown message kind: {0}")]
    UnknownKind(u16),
}
