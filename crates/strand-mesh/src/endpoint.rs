//! Direct UDP path to a remote peer.
//!
//! Every endpoint is a connected UDP socket dialled from the node's shared
//! local address. Address and port reuse let several endpoints (and the
//! node's STUN probes) share one local port and therefore one NAT mapping.

use crate::MeshError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use strand_core::MAX_BUFFER_SIZE;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Depth of the per-endpoint write queue.
pub const WRITE_QUEUE_CAPACITY: usize = 128;

/// Receiver of datagrams arriving on an endpoint.
pub trait UdpPacketHandler: Send + Sync {
    /// Called from the endpoint's read task for every datagram.
    fn on_udp_packet(&self, endpoint: &Arc<Endpoint>, data: &[u8]);
}

#[derive(Debug, Clone, Copy)]
struct PathState {
    latency: Duration,
    last_seen: Option<Instant>,
}

/// A connected UDP socket with its own read and write tasks
#[derive(Debug)]
pub struct Endpoint {
    address: SocketAddr,
    writes: mpsc::Sender<Vec<u8>>,
    die: watch::Sender<bool>,
    state: Mutex<PathState>,
}

/// Open a UDP socket bound to `local` with address reuse and connect it to
/// `remote`.
///
/// An IPv4 `local` is widened to the IPv6 unspecified address (same port)
/// when `remote` is IPv6.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, bound or connected.
pub fn dial(local: SocketAddr, remote: SocketAddr) -> Result<UdpSocket, MeshError> {
    let local = match (local.ip(), remote.ip()) {
        (IpAddr::V4(_), IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), local.port()),
        (IpAddr::V6(_), IpAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local.port()),
        _ => local,
    };

    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.connect(&remote.into())?;

    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket)?)
}

impl Endpoint {
    /// Start the read and write tasks for a connected `socket`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not connected.
    pub fn spawn(socket: UdpSocket, handler: Weak<dyn UdpPacketHandler>) -> Result<Arc<Self>, MeshError> {
        let address = socket.peer_addr()?;
        let (writes, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (die, _) = watch::channel(false);

        let endpoint = Arc::new(Self {
            address,
            writes,
            die,
            state: Mutex::new(PathState {
                latency: Duration::MAX,
                last_seen: None,
            }),
        });

        let socket = Arc::new(socket);
        tokio::spawn(read_loop(endpoint.clone(), socket.clone(), handler));
        tokio::spawn(write_loop(endpoint.address, socket, write_rx, endpoint.die.subscribe()));
        Ok(endpoint)
    }

    /// Remote address.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Queue a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::QueueFull`] if the write queue is full.
    pub fn write(&self, data: Vec<u8>) -> Result<(), MeshError> {
        self.writes.try_send(data).map_err(|_| MeshError::QueueFull)
    }

    /// One-way latency measured by the last discovery exchange.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.state.lock().map(|s| s.latency).unwrap_or(Duration::MAX)
    }

    /// Last time a discovery reply arrived.
    #[must_use]
    pub fn last_seen(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.last_seen)
    }

    /// Whether a reply arrived within `window` before `now`.
    #[must_use]
    pub fn is_reachable_at(&self, now: Instant, window: Duration) -> bool {
        self.last_seen()
            .is_some_and(|seen| now.saturating_duration_since(seen) < window)
    }

    /// Record a discovery reply.
    pub fn mark_seen(&self, latency: Duration, at: Instant) {
        if let Ok(mut state) = self.state.lock() {
            state.latency = latency;
            state.last_seen = Some(at);
        }
    }

    /// Stop both tasks. The socket closes once they exit.
    pub fn cancel(&self) {
        self.die.send_replace(true);
    }

    /// Whether [`Endpoint::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.die.borrow()
    }
}

async fn read_loop(endpoint: Arc<Endpoint>, socket: Arc<UdpSocket>, handler: Weak<dyn UdpPacketHandler>) {
    let mut die = endpoint.die.subscribe();
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];

    loop {
        if *die.borrow() {
            break;
        }
        let n = tokio::select! {
            _ = die.changed() => break,
            n = socket.recv(&mut buf) => n,
        };
        match n {
            Ok(n) => {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                tracing::trace!("Read {} bytes from {}", n, endpoint.address);
                handler.on_udp_packet(&endpoint, &buf[..n]);
            }
            // Connected UDP sockets surface ICMP errors on recv; keep going.
            Err(e) => tracing::trace!("Read from {} failed: {}", endpoint.address, e),
        }
    }
    tracing::debug!("Endpoint {} read task stopped", endpoint.address);
}

async fn write_loop(
    address: SocketAddr,
    socket: Arc<UdpSocket>,
    mut writes: mpsc::Receiver<Vec<u8>>,
    mut die: watch::Receiver<bool>,
) {
    loop {
        if *die.borrow() {
            break;
        }
        let data = tokio::select! {
            _ = die.changed() => break,
            data = writes.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        if let Err(e) = socket.send(&data).await {
            tracing::debug!("Write to {} failed: {}", address, e);
        }
    }
    tracing::debug!("Endpoint {} write task stopped", address);
}
