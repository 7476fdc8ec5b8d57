//! Encrypted tunnel to one remote peer.
//!
//! A tunnel delivers IP packets either directly over a discovered UDP
//! [`Endpoint`] or, when none is reachable, as a `Forward` through a relay
//! server. While relaying it periodically asks the peer to pair, which makes
//! both sides start UDP discovery towards each other's endpoints.
//!
//! ```text
//!            write(packet)
//!                 │
//!      reachable endpoint? ──yes──► Fragment over UDP
//!                 │ no
//!                 ▼
//!      Forward via relay ──► PairRequest (backoff: counter² seconds)
//! ```

use crate::endpoint::{self, Endpoint, UdpPacketHandler};
use crate::relay::{self, RelayProvider};
use crate::MeshError;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strand_core::codec::{decode_fragment, encode_fragment};
use strand_core::message::{Discovery, Forward, PeerInfo, SyncPeer, SyncPurpose};
use strand_core::{DISCOVERY_INTERVAL, FragmentHeader, Message, MessageKind, PeerId, ServerId};
use strand_crypto::aead::TunnelCipher;
use strand_crypto::random;
use strand_relay::PacketSender;
use tokio::sync::{mpsc, watch};

/// Receiver of decrypted packets arriving over UDP.
pub trait FragmentSink: Send + Sync {
    /// `packet` is a plaintext IP packet sent by peer `from`.
    fn on_fragment(&self, from: PeerId, packet: Vec<u8>);
}

/// Tunnel settings
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Local UDP address every endpoint socket is bound to
    pub local_addr: SocketAddr,
    /// Interval between discovery rounds
    pub discovery_interval: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            discovery_interval: DISCOVERY_INTERVAL,
        }
    }
}

/// How [`Tunnel::write`] delivered a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent over UDP to this endpoint
    Direct(SocketAddr),
    /// Sent as a `Forward` through a relay server
    Relayed,
}

#[derive(Debug, Default)]
struct Pairing {
    counter: u32,
    next_at: Option<Instant>,
}

/// Tunnel to a remote peer
pub struct Tunnel {
    me: Weak<Tunnel>,
    local_id: PeerId,
    peer_id: PeerId,
    peer_server: AtomicU64,
    cipher: TunnelCipher,
    relay: Arc<dyn RelayProvider>,
    sink: Arc<dyn FragmentSink>,
    options: TunnelOptions,
    disco: AtomicBool,
    closed: AtomicBool,
    local_endpoints: RwLock<Vec<String>>,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    remote_tx: mpsc::Sender<Vec<String>>,
    remote_rx: Mutex<Option<mpsc::Receiver<Vec<String>>>>,
    die: watch::Sender<bool>,
    pairing: Mutex<Pairing>,
}

impl Tunnel {
    /// Create a tunnel from `local_id` to `peer_id`, whose primary relay
    /// server is `peer_server`.
    #[must_use]
    pub fn new(
        local_id: PeerId,
        peer_id: PeerId,
        peer_server: ServerId,
        cipher: TunnelCipher,
        relay: Arc<dyn RelayProvider>,
        sink: Arc<dyn FragmentSink>,
        options: TunnelOptions,
    ) -> Arc<Self> {
        let (remote_tx, remote_rx) = mpsc::channel(2);
        let (die, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_id,
            peer_id,
            peer_server: AtomicU64::new(peer_server.0),
            cipher,
            relay,
            sink,
            options,
            disco: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local_endpoints: RwLock::new(Vec::new()),
            endpoints: RwLock::new(Vec::new()),
            remote_tx,
            remote_rx: Mutex::new(Some(remote_rx)),
            die,
            pairing: Mutex::new(Pairing::default()),
        })
    }

    /// Remote peer.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The remote peer's primary relay server.
    #[must_use]
    pub fn peer_server(&self) -> ServerId {
        ServerId(self.peer_server.load(Ordering::SeqCst))
    }

    /// Follow a change of the remote peer's primary relay server.
    pub fn set_peer_server(&self, server: ServerId) {
        self.peer_server.store(server.0, Ordering::SeqCst);
    }

    /// Cipher shared with the remote peer.
    #[must_use]
    pub fn cipher(&self) -> &TunnelCipher {
        &self.cipher
    }

    /// Whether the discovery task is running.
    #[must_use]
    pub fn is_disco(&self) -> bool {
        self.disco.load(Ordering::SeqCst)
    }

    /// Whether [`Tunnel::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the endpoints advertised in pairing requests.
    pub fn set_local_endpoints(&self, endpoints: Vec<String>) {
        if let Ok(mut current) = self.local_endpoints.write() {
            *current = endpoints;
        }
    }

    /// Endpoints advertised in pairing requests.
    #[must_use]
    pub fn local_endpoints(&self) -> Vec<String> {
        self.local_endpoints.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Addresses of the known endpoints, best first.
    #[must_use]
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoint_list().iter().map(|e| e.address()).collect()
    }

    fn endpoint_list(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Lowest latency endpoint that answered within two discovery intervals.
    #[must_use]
    pub fn reachable_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.reachable_endpoint_at(Instant::now())
    }

    fn reachable_endpoint_at(&self, now: Instant) -> Option<Arc<Endpoint>> {
        let window = self.options.discovery_interval * 2;
        self.endpoint_list()
            .into_iter()
            .find(|e| !e.is_cancelled() && e.is_reachable_at(now, window))
    }

    /// Send `packet` to the remote peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel is closed, the endpoint queue is full,
    /// no relay server is connected or encryption fails.
    pub fn write(&self, packet: &[u8]) -> Result<Delivery, MeshError> {
        self.write_at(packet, Instant::now())
    }

    pub(crate) fn write_at(&self, packet: &[u8], now: Instant) -> Result<Delivery, MeshError> {
        if self.is_closed() {
            return Err(MeshError::InvalidState("tunnel closed"));
        }

        if let Some(endpoint) = self.reachable_endpoint_at(now) {
            let fragment = self.seal_fragment(MessageKind::Fragment, packet)?;
            endpoint.write(fragment)?;
            tracing::trace!("Sent {} bytes to peer {} over {}", packet.len(), self.peer_id, endpoint.address());
            return Ok(Delivery::Direct(endpoint.address()));
        }

        let sender = relay::route(self.relay.as_ref(), self.peer_server()).ok_or(MeshError::NoRelay(self.peer_id))?;
        let nonce = random::nonce_u32();
        let fragment = self.cipher.seal(u64::from(nonce), packet)?;
        sender.send(Message::Forward(Forward {
            src_peer_id: self.local_id,
            dst_peer_id: self.peer_id,
            nonce,
            fragment,
        }))?;
        tracing::trace!("Relayed {} bytes to peer {}", packet.len(), self.peer_id);

        self.request_pairing(sender.as_ref(), now);
        Ok(Delivery::Relayed)
    }

    /// Ask the peer to start discovery, at most once per `counter²` seconds.
    fn request_pairing(&self, sender: &dyn PacketSender, now: Instant) {
        if self.is_disco() {
            return;
        }
        let endpoints = self.local_endpoints();
        if endpoints.is_empty() {
            return;
        }
        let Ok(mut pairing) = self.pairing.lock() else {
            return;
        };
        if pairing.next_at.is_some_and(|at| now < at) {
            return;
        }

        let request = SyncPeer {
            src_peer_id: self.local_id,
            dst_peer_id: self.peer_id,
            purpose: SyncPurpose::PairRequest,
            peer: Some(PeerInfo::from_id(self.local_id)),
            endpoints,
        };
        if let Err(e) = sender.send(Message::SyncPeer(request)) {
            tracing::warn!("Pair request to peer {} failed: {}", self.peer_id, e);
            return;
        }

        pairing.counter = pairing.counter.saturating_add(1);
        let backoff = u64::from(pairing.counter).saturating_mul(u64::from(pairing.counter));
        pairing.next_at = Some(now + Duration::from_secs(backoff));
        tracing::debug!("Pair request {} sent to peer {}", pairing.counter, self.peer_id);
    }

    /// Hand the peer's endpoints to the discovery task, starting it if
    /// needed.
    pub fn set_remote_endpoints(&self, endpoints: Vec<String>) {
        if self.is_closed() {
            return;
        }
        match self.remote_tx.try_send(endpoints) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(endpoints)) => {
                let tx = self.remote_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(endpoints).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }

        if self.disco.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(rx) = self.remote_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            self.disco.store(false, Ordering::SeqCst);
            return;
        };
        tracing::debug!("Starting discovery towards peer {}", self.peer_id);
        tokio::spawn(discovery_loop(self.me.clone(), rx, self.die.subscribe(), self.options.discovery_interval));
    }

    /// One discovery round over `addresses`.
    fn discover(&self, addresses: &[String]) {
        self.discover_at(addresses, Instant::now());
    }

    fn discover_at(&self, addresses: &[String], now: Instant) {
        let mut wanted: Vec<SocketAddr> = Vec::with_capacity(addresses.len());
        for address in addresses {
            match address.parse::<SocketAddr>() {
                Ok(remote) if !wanted.contains(&remote) => wanted.push(remote),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring endpoint {:?} of peer {}: {}", address, self.peer_id, e),
            }
        }

        // Drop endpoints the peer no longer advertises and those that
        // stopped answering.
        let stale_after = self.options.discovery_interval * 2;
        let known: HashSet<SocketAddr> = match self.endpoints.write() {
            Ok(mut endpoints) => {
                endpoints.retain(|e| {
                    let keep = wanted.contains(&e.address()) && !is_stale(e, now, stale_after);
                    if !keep {
                        e.cancel();
                    }
                    keep
                });
                endpoints.iter().map(|e| e.address()).collect()
            }
            Err(_) => return,
        };

        let handler: Weak<dyn UdpPacketHandler> = self.me.clone();
        let mut dialed = Vec::new();
        for &remote in wanted.iter().filter(|r| !known.contains(r)) {
            let spawned = endpoint::dial(self.options.local_addr, remote)
                .and_then(|socket| Endpoint::spawn(socket, handler.clone()));
            match spawned {
                Ok(endpoint) => dialed.push(endpoint),
                Err(e) => tracing::warn!("Dial {} for peer {} failed: {}", remote, self.peer_id, e),
            }
        }

        let targets: Vec<Arc<Endpoint>> = {
            let Ok(mut endpoints) = self.endpoints.write() else {
                dialed.iter().for_each(|e| e.cancel());
                return;
            };
            if self.is_closed() {
                dialed.iter().for_each(|e| e.cancel());
                return;
            }
            for endpoint in dialed {
                if endpoints.iter().any(|e| e.address() == endpoint.address()) {
                    endpoint.cancel();
                } else {
                    endpoints.push(endpoint);
                }
            }
            sort_endpoints(&mut endpoints);
            endpoints.iter().filter(|e| wanted.contains(&e.address())).cloned().collect()
        };

        for endpoint in &targets {
            self.send_discovery(endpoint);
        }
    }

    fn send_discovery(&self, endpoint: &Endpoint) {
        let probe = Discovery {
            sender_peer_id: self.local_id,
            timestamp: unix_micros(),
        };
        if let Err(e) = self.write_discovery(endpoint, probe) {
            tracing::debug!("Discovery to {} failed: {}", endpoint.address(), e);
        }
    }

    fn write_discovery(&self, endpoint: &Endpoint, probe: Discovery) -> Result<(), MeshError> {
        let payload = Message::Discovery(probe).encode_payload()?;
        let fragment = self.seal_fragment(MessageKind::Discovery, &payload)?;
        endpoint.write(fragment)
    }

    fn seal_fragment(&self, kind: MessageKind, plaintext: &[u8]) -> Result<Vec<u8>, MeshError> {
        let nonce = random::nonce_u32();
        let ciphertext = self.cipher.seal(u64::from(nonce), plaintext)?;
        let header = FragmentHeader {
            nonce,
            kind,
            peer_id: self.local_id,
        };
        Ok(encode_fragment(header, &ciphertext))
    }

    #[cfg(test)]
    pub(crate) fn add_endpoint(&self, endpoint: Arc<Endpoint>) {
        let Ok(mut endpoints) = self.endpoints.write() else {
            return;
        };
        if self.is_closed() {
            endpoint.cancel();
            return;
        }
        endpoints.push(endpoint);
        sort_endpoints(&mut endpoints);
    }

    fn on_discovery(&self, endpoint: &Arc<Endpoint>, probe: Discovery) {
        if probe.sender_peer_id != self.local_id {
            if let Err(e) = self.write_discovery(endpoint, probe) {
                tracing::debug!("Discovery echo to {} failed: {}", endpoint.address(), e);
            }
        }

        let elapsed = unix_micros().saturating_sub(probe.timestamp);
        endpoint.mark_seen(Duration::from_micros(elapsed / 2), Instant::now());

        let Ok(mut endpoints) = self.endpoints.write() else {
            return;
        };
        if !endpoints.iter().any(|e| Arc::ptr_eq(e, endpoint)) {
            if endpoint.is_cancelled() || self.is_closed() {
                return;
            }
            if endpoints.iter().any(|e| e.address() == endpoint.address()) {
                endpoint.cancel();
                return;
            }
            tracing::debug!("New endpoint {} for peer {}", endpoint.address(), self.peer_id);
            endpoints.push(endpoint.clone());
        }
        sort_endpoints(&mut endpoints);
    }

    /// Cancel all endpoints and stop discovery. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing tunnel to peer {}", self.peer_id);

        let endpoints = self
            .endpoints
            .write()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default();
        for endpoint in endpoints {
            endpoint.cancel();
        }
        self.die.send_replace(true);
    }
}

impl UdpPacketHandler for Tunnel {
    fn on_udp_packet(&self, endpoint: &Arc<Endpoint>, data: &[u8]) {
        let (header, ciphertext) = match decode_fragment(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!("Malformed datagram from {}: {}", endpoint.address(), e);
                return;
            }
        };
        if !matches!(header.kind, MessageKind::Discovery | MessageKind::Fragment) {
            tracing::warn!("Unexpected {:?} datagram from {}", header.kind, endpoint.address());
            return;
        }

        let plaintext = match self.cipher.open(u64::from(header.nonce), ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!("Decrypt datagram from peer {} failed: {}", header.peer_id, e);
                return;
            }
        };

        match header.kind {
            MessageKind::Discovery => match Message::decode(MessageKind::Discovery, &plaintext) {
                Ok(Message::Discovery(probe)) => self.on_discovery(endpoint, probe),
                Ok(other) => tracing::warn!("Unexpected {:?} in discovery datagram", other.kind()),
                Err(e) => tracing::debug!("Decode discovery from {} failed: {}", endpoint.address(), e),
            },
            _ => self.sink.on_fragment(self.peer_id, plaintext),
        }
    }
}

async fn discovery_loop(
    tunnel: Weak<Tunnel>,
    mut remote_rx: mpsc::Receiver<Vec<String>>,
    mut die: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut addresses: Vec<String> = Vec::new();
    let tick = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(tick);

    loop {
        if *die.borrow() {
            break;
        }
        tokio::select! {
            _ = die.changed() => break,
            list = remote_rx.recv() => match list {
                Some(list) => {
                    addresses = list;
                    tick.as_mut().reset(tokio::time::Instant::now());
                }
                None => break,
            },
            () = &mut tick => {
                tick.as_mut().reset(tokio::time::Instant::now() + interval);
                if addresses.is_empty() {
                    continue;
                }
                let Some(tunnel) = tunnel.upgrade() else {
                    break;
                };
                tunnel.discover(&addresses);
            }
        }
    }

    if let Some(tunnel) = tunnel.upgrade() {
        tunnel.disco.store(false, Ordering::SeqCst);
    }
}

/// Answering endpoints first, then by latency. Keys are read once per
/// endpoint since read tasks update them outside the list lock.
fn sort_endpoints(endpoints: &mut [Arc<Endpoint>]) {
    endpoints.sort_by_cached_key(|e| (e.last_seen().is_none(), e.latency()));
}

/// An endpoint that answered once but not within `window`.
fn is_stale(endpoint: &Endpoint, now: Instant, window: Duration) -> bool {
    endpoint
        .last_seen()
        .is_some_and(|seen| now.saturating_duration_since(seen) > window)
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("peer_id", &self.peer_id)
            .field("disco", &self.is_disco())
            .field("endpoints", &self.endpoints())
            .field("closed", &self.is_closed())
            .finish()
    }
}
