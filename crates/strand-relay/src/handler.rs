//! Message dispatch tables.
//!
//! A [`Handler`] maps each [`MessageKind`] to one callback. Sessions on a
//! server share the server's handler; every client owns its own.

use crate::RelayError;
use crate::transport::Link;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use strand_core::codec::Frame;
use strand_core::{Message, MessageKind};

/// Callback invoked with the connection the message arrived on.
pub type Callback<T> = Arc<dyn Fn(&Arc<T>, Message) -> Result<(), RelayError> + Send + Sync>;

/// Kind-indexed callback table
pub struct Handler<T> {
    callbacks: RwLock<HashMap<MessageKind, Callback<T>>>,
}

impl<T> Handler<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Register `callback` for `kind`, replacing any previous one.
    pub fn on<F>(&self, kind: MessageKind, callback: F)
    where
        F: Fn(&Arc<T>, Message) -> Result<(), RelayError> + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.insert(kind, Arc::new(callback));
        }
    }

    /// Callback registered for `kind`.
    #[must_use]
    pub fn get(&self, kind: MessageKind) -> Option<Callback<T>> {
        self.callbacks
            .read()
            .ok()
            .and_then(|callbacks| callbacks.get(&kind).cloned())
    }

    /// Whether a callback is registered for `kind`.
    #[must_use]
    pub fn handles(&self, kind: MessageKind) -> bool {
        self.callbacks
            .read()
            .map(|callbacks| callbacks.contains_key(&kind))
            .unwrap_or(false)
    }
}

impl<T> Handler<T> {
    /// Decode `frame` and run its callback against `conn`.
    ///
    /// Before the handshake completes only handshake kinds are accepted;
    /// afterwards handshake kinds are rejected. Errors from this method
    /// (including errors returned by handshake callbacks) are protocol
    /// violations and the caller must close the connection. Errors from
    /// other callbacks are logged and only that message is skipped.
    pub(crate) fn dispatch(
        &self,
        conn: &Arc<T>,
        link: &Link,
        established: bool,
        frame: Frame,
    ) -> Result<(), RelayError> {
        let kind = frame.kind;
        if kind.is_handshake() == established {
            return Err(RelayError::UnexpectedMessage(kind));
        }
        if established && !link.has_cipher() {
            return Err(RelayError::MissingCipher);
        }

        let callback = self.get(kind).ok_or(RelayError::UnhandledMessage(kind))?;
        let msg = link.open(&frame)?;

        if kind.is_handshake() {
            return callback(conn, msg);
        }
        if let Err(e) = callback(conn, msg) {
            tracing::warn!("{:?}: callback failed: {}", kind, e);
        }
        Ok(())
    }
}

impl<T> Default for Handler<T> {
    fn default() -> Self {
        Self::new()
    }
}
