//! Relay client for connecting a node to a relay server.
//!
//! A client is single use: it moves `Init → Connecting → Connected` once and
//! is discarded after close. The relay manager creates a new client for
//! every reconnect attempt.

use crate::duration::parse_interval;
use crate::handler::Handler;
use crate::transport::{Link, LinkOptions};
use crate::{PacketSender, RelayError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strand_core::codec::Frame;
use strand_core::message::{Handshake, Heartbeat};
use strand_core::protocol::RelayServer;
use strand_core::{HEARTBEAT_INTERVAL, Message, MessageKind, ServerId};
use strand_crypto::noise::NoiseHandshake;
use strand_crypto::x25519::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

type ClosedHook = Box<dyn FnOnce(&Arc<Client>) + Send>;

/// Relay client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Created, not yet dialed
    Init = 0,
    /// Handshake in flight
    Connecting = 1,
    /// Handshake completed; business messages flow
    Connected = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Connected,
    Closed,
}

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbound / inbound queue depth
    pub queue_capacity: usize,
    /// Deadline for a single frame write
    pub write_timeout: Duration,
    /// Delay before the first heartbeat
    pub first_heartbeat_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            write_timeout: Duration::from_secs(5),
            first_heartbeat_delay: Duration::from_secs(1),
        }
    }
}

/// What a node presents to relay servers.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Node static public key
    pub public_key: PublicKey,
    /// Raw credential issued by the control plane
    pub credential: Vec<u8>,
}

/// Relay client
pub struct Client {
    server: RelayServer,
    server_key: PublicKey,
    identity: ClientIdentity,
    is_primary: bool,
    config: ClientConfig,
    handler: Handler<Client>,
    state: AtomicU8,
    closed: AtomicBool,
    link: OnceLock<Link>,
    noise: Mutex<Option<NoiseHandshake>>,
    heartbeat_interval: Mutex<Duration>,
    latency: Mutex<Option<Duration>>,
    phase: watch::Sender<Phase>,
    on_closed: Mutex<Option<ClosedHook>>,
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Client {
    /// Create a client for `server`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server's published public key is not valid
    /// base64 X25519.
    pub fn new(
        server: RelayServer,
        identity: ClientIdentity,
        is_primary: bool,
        config: ClientConfig,
    ) -> Result<Arc<Self>, RelayError> {
        let server_key = PublicKey::from_base64(&server.public_key)?;
        let (phase, _) = watch::channel(Phase::Pending);

        let client = Arc::new(Self {
            server,
            server_key,
            identity,
            is_primary,
            config,
            handler: Handler::new(),
            state: AtomicU8::new(ClientState::Init as u8),
            closed: AtomicBool::new(false),
            link: OnceLock::new(),
            noise: Mutex::new(None),
            heartbeat_interval: Mutex::new(HEARTBEAT_INTERVAL),
            latency: Mutex::new(None),
            phase,
            on_closed: Mutex::new(None),
        });

        client
            .handler
            .on(MessageKind::HandshakeAck, |client: &Arc<Client>, msg| {
                client.on_handshake_ack(msg)
            });
        client
            .handler
            .on(MessageKind::Heartbeat, |client: &Arc<Client>, msg| {
                client.on_heartbeat(msg)
            });

        Ok(client)
    }

    /// Callback table for business messages from the server.
    #[must_use]
    pub fn handler(&self) -> &Handler<Client> {
        &self.handler
    }

    /// Install the hook run once when the client closes.
    pub fn set_on_closed<F>(&self, hook: F)
    where
        F: FnOnce(&Arc<Client>) + Send + 'static,
    {
        if let Ok(mut slot) = self.on_closed.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Dial the server over TCP and complete the handshake within `timeout`.
    ///
    /// # Errors
    ///
    /// - [`RelayError::InvalidState`] if the client was already started
    /// - [`RelayError::Timeout`] if the handshake does not finish in time
    /// - [`RelayError::Closed`] if the server closes the connection
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<(), RelayError> {
        self.begin_connect()?;
        let started = Instant::now();

        let address = self.server.address();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = self.close();
                return Err(e.into());
            }
            Err(_) => {
                let _ = self.close();
                return Err(RelayError::Timeout);
            }
        };
        let _ = stream.set_nodelay(true);
        let remote = stream.peer_addr().ok();

        self.handshake(stream, remote, timeout.saturating_sub(started.elapsed()))
            .await
    }

    /// Complete the handshake over an already connected stream.
    ///
    /// # Errors
    ///
    /// Same as [`Client::connect`].
    pub async fn connect_stream<S>(self: &Arc<Self>, stream: S, timeout: Duration) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        self.begin_connect()?;
        self.handshake(stream, None, timeout).await
    }

    fn begin_connect(&self) -> Result<(), RelayError> {
        self.state
            .compare_exchange(
                ClientState::Init as u8,
                ClientState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|_| RelayError::InvalidState("client already started"))
    }

    async fn handshake<S>(
        self: &Arc<Self>,
        stream: S,
        remote: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let result = tokio::time::timeout(timeout, self.start(stream, remote)).await;
        match result {
            Ok(Ok(())) => {
                tokio::spawn(self.clone().heartbeat());
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = self.close();
                Err(e)
            }
            Err(_) => {
                tracing::warn!("Handshake with relay server {} timed out", self.server.id);
                let _ = self.close();
                Err(RelayError::Timeout)
            }
        }
    }

    async fn start<S>(self: &Arc<Self>, stream: S, remote: Option<SocketAddr>) -> Result<(), RelayError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let options = LinkOptions {
            queue_capacity: self.config.queue_capacity,
            read_timeout: None,
            write_timeout: Some(self.config.write_timeout),
        };
        let label = format!("relay client {}", self.server.id);
        let (link, inbound) = Link::spawn(stream, remote, label, options);
        if self.link.set(link).is_err() {
            return Err(RelayError::InvalidState("client already started"));
        }
        if self.is_closed() {
            // Closed while dialing; make sure the new pumps stop too.
            if let Some(link) = self.link.get() {
                let _ = link.close();
            }
            return Err(RelayError::Closed);
        }
        tokio::spawn(self.clone().serve(inbound));

        let mut noise = NoiseHandshake::initiator()?;
        let message = noise.write_message(&self.identity.credential)?;
        if let Ok(mut slot) = self.noise.lock() {
            *slot = Some(noise);
        }

        self.send(Message::Handshake(Handshake {
            public_key: self.identity.public_key.to_bytes().to_vec(),
            message,
            is_primary: self.is_primary,
        }))?;

        let mut phase = self.phase.subscribe();
        loop {
            match *phase.borrow_and_update() {
                Phase::Connected => return Ok(()),
                Phase::Closed => return Err(RelayError::Closed),
                Phase::Pending => {}
            }
            if phase.changed().await.is_err() {
                return Err(RelayError::Closed);
            }
        }
    }

    async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            let Some(link) = self.link.get() else {
                break;
            };
            let established = self.state() == ClientState::Connected;
            if let Err(e) = self.handler.dispatch(&self, link, established, frame) {
                tracing::warn!("Relay server {} protocol error: {}", self.server.id, e);
                break;
            }
        }
        let _ = self.close();
    }

    async fn heartbeat(self: Arc<Self>) {
        let Some(mut die) = self.link.get().map(Link::subscribe) else {
            return;
        };
        let mut delay = self.config.first_heartbeat_delay;

        loop {
            tokio::select! {
                _ = die.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if *die.borrow() {
                break;
            }

            if self.state() == ClientState::Connected {
                let beat = Heartbeat {
                    timestamp: unix_nanos(),
                };
                match self.send(beat.into()) {
                    Ok(()) => {}
                    Err(RelayError::Closed) => break,
                    Err(e) => tracing::warn!("Heartbeat to relay server {} failed: {}", self.server.id, e),
                }
            }
            delay = self.heartbeat_interval();
        }
    }

    fn on_handshake_ack(self: &Arc<Self>, msg: Message) -> Result<(), RelayError> {
        let Message::HandshakeAck(ack) = msg else {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        };
        let link = self.link.get().ok_or(RelayError::NotConnected)?;
        let mut noise = self
            .noise
            .lock()
            .ok()
            .and_then(|mut n| n.take())
            .ok_or(RelayError::InvalidState("no handshake in progress"))?;

        let payload = noise.read_message(&ack.message)?;
        let interval = std::str::from_utf8(&payload)
            .ok()
            .and_then(parse_interval)
            .unwrap_or(HEARTBEAT_INTERVAL);
        let cipher = noise.into_transport()?;

        link.set_cipher(cipher);
        if let Ok(mut current) = self.heartbeat_interval.lock() {
            *current = interval;
        }
        self.state.store(ClientState::Connected as u8, Ordering::SeqCst);
        self.phase.send_replace(Phase::Connected);

        tracing::info!(
            "Connected to relay server {} ({}), heartbeat every {:?}",
            self.server.id,
            self.server.address(),
            interval
        );
        Ok(())
    }

    fn on_heartbeat(&self, msg: Message) -> Result<(), RelayError> {
        let Message::Heartbeat(beat) = msg else {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        };
        let rtt = Duration::from_nanos(unix_nanos().saturating_sub(beat.timestamp));
        if let Ok(mut latency) = self.latency.lock() {
            *latency = Some(rtt / 2);
        }
        Ok(())
    }

    /// Queue a message to the server.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotConnected`] before [`Client::connect`]
    /// - [`RelayError::Closed`] after close
    /// - [`RelayError::SendBufferExceeded`] if the queue is full
    pub fn send(&self, msg: Message) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.link.get().ok_or(RelayError::NotConnected)?.send(msg)
    }

    /// Close the client and run the close hook once.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyClosed`] on every call after the first.
    pub fn close(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyClosed);
        }
        if let Some(link) = self.link.get() {
            let _ = link.close();
        }
        self.phase.send_replace(Phase::Closed);
        tracing::debug!("Relay client for server {} closed", self.server.id);

        let hook = self.on_closed.lock().ok().and_then(|mut h| h.take());
        if let Some(hook) = hook {
            hook(self);
        }
        Ok(())
    }

    /// Whether the client is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::SeqCst) {
            2 => ClientState::Connected,
            1 => ClientState::Connecting,
            _ => ClientState::Init,
        }
    }

    /// Relay server this client talks to.
    #[must_use]
    pub fn server(&self) -> &RelayServer {
        &self.server
    }

    /// Relay server id.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.server.id
    }

    /// Public key the server published.
    #[must_use]
    pub fn server_key(&self) -> &PublicKey {
        &self.server_key
    }

    /// Whether this server is the node's primary relay.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Heartbeat interval negotiated in the handshake.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
            .lock()
            .map(|d| *d)
            .unwrap_or(HEARTBEAT_INTERVAL)
    }

    /// Half of the last heartbeat round trip.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.latency.lock().ok().and_then(|l| *l)
    }
}

impl PacketSender for Client {
    fn send(&self, msg: Message) -> Result<(), RelayError> {
        Client::send(self, msg)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server.id)
            .field("state", &self.state())
            .field("primary", &self.is_primary)
            .finish()
    }
}
