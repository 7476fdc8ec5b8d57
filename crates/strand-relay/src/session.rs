//! Server side of a relay connection.
//!
//! A session starts in [`SessionState::Init`] and only accepts a
//! `Handshake`. Once the node's credential has been verified the session is
//! [`SessionState::Running`], carries the node's identity and is registered
//! with the server under its peer id.

use crate::handler::Handler;
use crate::transport::{Link, LinkOptions};
use crate::{PacketSender, RelayError};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use strand_core::codec::Frame;
use strand_core::message::{Handshake, HandshakeAck};
use strand_core::{Message, PeerId, UserId};
use strand_crypto::credential::CredentialVerifier;
use strand_crypto::noise::NoiseHandshake;
use strand_crypto::x25519::PublicKey;
use tokio::sync::{mpsc, watch};

type ClosedHook = Box<dyn FnOnce(&Arc<Session>) + Send>;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for the client handshake
    Init = 0,
    /// Handshake verified; business messages flow
    Running = 1,
}

/// A node connected to this relay server
pub struct Session {
    link: Link,
    handler: Arc<Handler<Session>>,
    heartbeat_interval: Duration,
    state: AtomicU8,
    peer_id: AtomicU64,
    user_id: AtomicU64,
    is_primary: AtomicBool,
    vaddr: RwLock<Option<IpAddr>>,
    public_key: RwLock<Option<PublicKey>>,
    sync_at: Mutex<Option<Instant>>,
    last_heartbeat: Mutex<Option<Instant>>,
    on_closed: Mutex<Option<ClosedHook>>,
}

impl Session {
    /// Start a session over `stream`.
    ///
    /// The read deadline is twice the heartbeat interval and the write
    /// deadline one interval. The session closes itself when the stream
    /// fails, a protocol error occurs or `shutdown` flips to true.
    pub(crate) fn start<S>(
        stream: S,
        remote_addr: Option<SocketAddr>,
        handler: Arc<Handler<Session>>,
        heartbeat_interval: Duration,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
        on_closed: ClosedHook,
    ) -> Arc<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let label = match remote_addr {
            Some(addr) => format!("session {addr}"),
            None => "session".to_string(),
        };
        let options = LinkOptions {
            queue_capacity,
            read_timeout: Some(heartbeat_interval * 2),
            write_timeout: Some(heartbeat_interval),
        };
        let (link, inbound) = Link::spawn(stream, remote_addr, label, options);

        let session = Arc::new(Self {
            link,
            handler,
            heartbeat_interval,
            state: AtomicU8::new(SessionState::Init as u8),
            peer_id: AtomicU64::new(0),
            user_id: AtomicU64::new(0),
            is_primary: AtomicBool::new(false),
            vaddr: RwLock::new(None),
            public_key: RwLock::new(None),
            sync_at: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
            on_closed: Mutex::new(Some(on_closed)),
        });

        tokio::spawn(session.clone().serve(inbound, shutdown));
        session
    }

    async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<Frame>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let established = self.state() == SessionState::Running;
            if let Err(e) = self.handler.dispatch(&self, &self.link, established, frame) {
                tracing::warn!(
                    "Session {} (peer {}) protocol error: {}",
                    self.remote_label(),
                    self.peer_id(),
                    e
                );
                break;
            }
        }

        let _ = self.close();
    }

    /// Verify the client's handshake and switch to the running state.
    ///
    /// Returns the reply to send back. The caller registers the session
    /// before queueing the reply.
    pub(crate) fn accept_handshake(
        &self,
        hello: Handshake,
        verifier: &CredentialVerifier,
    ) -> Result<HandshakeAck, RelayError> {
        if self.state() != SessionState::Init {
            return Err(RelayError::InvalidState("session already running"));
        }

        let mut noise = NoiseHandshake::responder()?;
        let credential = noise.read_message(&hello.message)?;
        let claims = verifier
            .verify(&credential)
            .map_err(|e| RelayError::Unauthenticated(e.to_string()))?;

        let interval = crate::duration::format_interval(self.heartbeat_interval);
        let reply = noise.write_message(interval.as_bytes())?;
        let cipher = noise.into_transport()?;

        self.link.set_cipher(cipher);
        self.user_id.store(claims.user_id, Ordering::SeqCst);
        self.peer_id.store(claims.peer_id, Ordering::SeqCst);
        self.is_primary.store(hello.is_primary, Ordering::SeqCst);
        if let Ok(mut vaddr) = self.vaddr.write() {
            *vaddr = Some(claims.ip);
        }
        if let Ok(mut key) = self.public_key.write() {
            *key = PublicKey::from_slice(&hello.public_key).ok();
        }
        self.state.store(SessionState::Running as u8, Ordering::SeqCst);

        Ok(HandshakeAck { message: reply })
    }

    /// Record a heartbeat and echo it back.
    pub(crate) fn on_heartbeat(&self, msg: Message) -> Result<(), RelayError> {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Some(Instant::now());
        }
        self.send(msg)
    }

    /// Queue a message to the node.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SendBufferExceeded`] if the queue is full and
    /// [`RelayError::Closed`] after close.
    pub fn send(&self, msg: Message) -> Result<(), RelayError> {
        self.link.send(msg)
    }

    /// Close the session and run the close hook once.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyClosed`] on every call after the first.
    pub fn close(self: &Arc<Self>) -> Result<(), RelayError> {
        self.link.close()?;
        tracing::debug!("Session {} (peer {}) closed", self.remote_label(), self.peer_id());
        let hook = self.on_closed.lock().ok().and_then(|mut h| h.take());
        if let Some(hook) = hook {
            hook(self);
        }
        Ok(())
    }

    /// Whether the session is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            1 => SessionState::Running,
            _ => SessionState::Init,
        }
    }

    /// Peer id from the credential; zero before the handshake.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.peer_id.load(Ordering::SeqCst))
    }

    /// User id from the credential; zero before the handshake.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        UserId(self.user_id.load(Ordering::SeqCst))
    }

    /// Virtual address from the credential.
    #[must_use]
    pub fn vaddr(&self) -> Option<IpAddr> {
        self.vaddr.read().ok().and_then(|v| *v)
    }

    /// Static public key the node presented.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key.read().ok().and_then(|k| *k)
    }

    /// Whether this server is the node's primary relay.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Last time this session was reported upstream.
    #[must_use]
    pub fn sync_at(&self) -> Option<Instant> {
        self.sync_at.lock().ok().and_then(|s| *s)
    }

    /// Record that this session was reported upstream.
    pub fn set_sync_at(&self, at: Instant) {
        if let Ok(mut sync_at) = self.sync_at.lock() {
            *sync_at = Some(at);
        }
    }

    /// Time of the last heartbeat received.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat.lock().ok().and_then(|h| *h)
    }

    /// Remote socket address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    fn remote_label(&self) -> String {
        self.remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

impl PacketSender for Session {
    fn send(&self, msg: Message) -> Result<(), RelayError> {
        Session::send(self, msg)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id())
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
