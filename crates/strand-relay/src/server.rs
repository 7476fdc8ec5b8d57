//! Relay server.
//!
//! Accepts TCP connections from nodes, authenticates them with their
//! credential and keeps one live [`Session`] per peer id. Business
//! behaviour (forwarding, probing) is installed as callbacks on the
//! server's [`Handler`]; see [`crate::hooks`].

use crate::events::ServerEvent;
use crate::handler::Handler;
use crate::session::Session;
use crate::RelayError;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use strand_core::{HEARTBEAT_INTERVAL, Message, MessageKind, PeerId};
use strand_crypto::credential::CredentialVerifier;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Heartbeat interval announced to clients
    pub heartbeat_interval: Duration,
    /// Per-session queue depth
    pub session_queue_capacity: usize,
    /// Depth of the server event channel
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            session_queue_capacity: 128,
            event_capacity: 256,
        }
    }
}

/// Relay server
pub struct Server {
    config: ServerConfig,
    verifier: RwLock<CredentialVerifier>,
    sessions: DashMap<PeerId, Arc<Session>>,
    handler: Arc<Handler<Session>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
}

impl Server {
    /// Create a server that verifies credentials with `verifier`.
    ///
    /// `Handshake` and `Heartbeat` handling is registered on the handler.
    #[must_use]
    pub fn new(config: ServerConfig, verifier: CredentialVerifier) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<Server>| {
            let handler = Arc::new(Handler::new());

            let server = weak.clone();
            handler.on(MessageKind::Handshake, move |session: &Arc<Session>, msg| {
                let server = server.upgrade().ok_or(RelayError::Closed)?;
                server.on_handshake(session, msg)
            });
            handler.on(MessageKind::Heartbeat, |session: &Arc<Session>, msg| {
                session.on_heartbeat(msg)
            });

            Self {
                config,
                verifier: RwLock::new(verifier),
                sessions: DashMap::new(),
                handler,
                closed: AtomicBool::new(false),
                shutdown,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }
        })
    }

    /// Callback table shared by every session.
    #[must_use]
    pub fn handler(&self) -> &Handler<Session> {
        &self.handler
    }

    /// Accept connections from `listener` until [`Server::close`].
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        tracing::info!("Relay server listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let (stream, addr) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted?,
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay for {} failed: {}", addr, e);
            }
            tracing::debug!("Accepted relay connection from {}", addr);
            self.accept(stream, Some(addr));
        }

        tracing::info!("Relay server stopped");
        Ok(())
    }

    /// Start a session over an already accepted stream.
    pub fn accept<S>(self: &Arc<Self>, stream: S, remote_addr: Option<SocketAddr>) -> Arc<Session>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let server = Arc::downgrade(self);
        Session::start(
            stream,
            remote_addr,
            self.handler.clone(),
            self.config.heartbeat_interval,
            self.config.session_queue_capacity,
            self.shutdown.subscribe(),
            Box::new(move |session| {
                if let Some(server) = server.upgrade() {
                    server.on_session_closed(session);
                }
            }),
        )
    }

    fn on_handshake(&self, session: &Arc<Session>, msg: Message) -> Result<(), RelayError> {
        let Message::Handshake(hello) = msg else {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        };

        let verifier = self
            .verifier
            .read()
            .map_err(|_| RelayError::InvalidState("verifier lock poisoned"))?
            .clone();
        let ack = session.accept_handshake(hello, &verifier)?;

        tracing::info!(
            "Session handshake completed: peer {} user {} vaddr {:?} primary {}",
            session.peer_id(),
            session.user_id(),
            session.vaddr(),
            session.is_primary()
        );

        self.on_session_handshake(session);
        session.send(Message::HandshakeAck(ack))
    }

    /// Register a freshly authenticated session, evicting any older session
    /// for the same peer.
    fn on_session_handshake(&self, session: &Arc<Session>) {
        let peer_id = session.peer_id();
        if peer_id.is_zero() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let Some(old) = self.sessions.insert(peer_id, session.clone()) else {
            return;
        };
        if !Arc::ptr_eq(&old, session) {
            tracing::info!("Replacing stale session for peer {}", peer_id);
            let _ = old.close();
        }
    }

    /// Remove the registry entry only if it still points at `session`.
    fn on_session_closed(&self, session: &Arc<Session>) {
        let peer_id = session.peer_id();
        if peer_id.is_zero() {
            return;
        }

        let removed = self
            .sessions
            .remove_if(&peer_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if !removed {
            return;
        }

        tracing::debug!("Session for peer {} unregistered", peer_id);
        if let Err(e) = self.events_tx.try_send(ServerEvent::SessionClosed { peer_id }) {
            tracing::warn!("Dropping server event for peer {}: {}", peer_id, e);
        }
    }

    /// Live session for `peer_id`.
    #[must_use]
    pub fn session(&self, peer_id: PeerId) -> Option<Arc<Session>> {
        self.sessions.get(&peer_id).map(|s| s.value().clone())
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Visit a snapshot of every registered session.
    pub fn for_each_session<F: FnMut(&Arc<Session>)>(&self, mut f: F) {
        let snapshot: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for session in &snapshot {
            f(session);
        }
    }

    /// Replace the credential verification key.
    pub fn set_credential_key(&self, verifier: CredentialVerifier) {
        if let Ok(mut current) = self.verifier.write() {
            *current = verifier;
        }
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Stop accepting and close every session.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            let _ = session.close();
        }
    }

    /// Whether [`Server::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
