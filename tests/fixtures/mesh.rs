//! In-process mesh fixture: a real relay server on loopback and nodes
//! driven by a scripted control plane and a channel-backed device.
//!
//! # Example
//!
//! ```no_run
//! use strand_integration_tests::fixtures::{TestRelay, start_node, ipv4_packet, vaddr};
//! use strand_mesh::DriverConfig;
//!
//! # async fn example() {
//! let relay = TestRelay::start(1).await;
//! let a = start_node(1, &relay, &[1, 2], DriverConfig::default()).await;
//! let mut b = start_node(2, &relay, &[1, 2], DriverConfig::default()).await;
//!
//! a.device.inject(ipv4_packet(vaddr(1), vaddr(2), b"ping")).await;
//! let packet = b.device.next_packet().await;
//! # }
//! ```

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use strand_core::protocol::{
    Network, Peer, PeerGraphResponse, PreflightResponse, RelayServer, RenewCredentialRequest,
    RenewCredentialResponse,
};
use strand_core::{NetworkId, PeerId, ServerId, UserId};
use strand_crypto::credential::{CredentialClaims, CredentialSigner};
use strand_crypto::random;
use strand_crypto::x25519::PrivateKey;
use strand_mesh::{ControlPlane, Device, Driver, DriverConfig, MemoryRouter, MeshError, Router};
use strand_relay::{Server, ServerConfig, hooks};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// How long fixture waits last before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner of every fixture node.
pub const USER_ID: u64 = 7;

/// Signing key shared by every fixture; RSA keygen is slow.
pub fn signer() -> &'static CredentialSigner {
    static SIGNER: OnceLock<CredentialSigner> = OnceLock::new();
    SIGNER.get_or_init(|| CredentialSigner::generate(1024).expect("rsa keygen"))
}

/// Fresh random X25519 key.
pub fn random_key() -> PrivateKey {
    let mut bytes = [0u8; 32];
    random::fill_bytes(&mut bytes);
    PrivateKey::from_bytes(bytes)
}

/// Virtual address of fixture peer `peer_id`.
pub fn vaddr(peer_id: u64) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, peer_id as u8)
}

/// Base64 credential for `peer_id` valid for `lease`.
pub fn credential(peer_id: u64, lease: Duration) -> String {
    let claims = CredentialClaims::with_lease(USER_ID, peer_id, IpAddr::V4(vaddr(peer_id)), lease);
    STANDARD.encode(signer().issue(&claims).expect("issue credential"))
}

/// Minimal IPv4 packet (UDP protocol number, no checksum) around `payload`.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}

/// Poll `condition` every 10ms until it holds or [`WAIT_TIMEOUT`] passes.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Relay server listening on an ephemeral loopback port.
pub struct TestRelay {
    /// Running server
    pub server: Arc<Server>,
    /// Descriptor handed to nodes
    pub descriptor: RelayServer,
}

impl TestRelay {
    /// Start a forwarding relay server with id `id`.
    pub async fn start(id: u64) -> Self {
        let server = Server::new(ServerConfig::default(), signer().verifier());
        hooks::register_forwarding(&server);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr: SocketAddr = listener.local_addr().expect("relay addr");
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        let descriptor = RelayServer {
            id: ServerId(id),
            name: format!("relay-{id}"),
            region: "test".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            stun_port: 0,
            public_key: random_key().public_key().to_base64(),
        };
        Self { server, descriptor }
    }

    /// Whether `peer_id` has a live session.
    pub fn has_session(&self, peer_id: u64) -> bool {
        self.server.session(PeerId(peer_id)).is_some()
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.server.close();
    }
}

/// Peer graph in which every listed peer uses `relay` and shares one network.
pub fn peer_graph(relay: &RelayServer, peer_ids: &[u64], hash: &str) -> PeerGraphResponse {
    let mut ids = peer_ids.to_vec();
    ids.sort_unstable();
    PeerGraphResponse {
        not_modified: false,
        unique_hash: hash.to_string(),
        update_interval: 0,
        relay_servers: vec![relay.clone()],
        peers: ids
            .iter()
            .map(|&id| Peer {
                id: PeerId(id),
                user_id: UserId(USER_ID),
                name: format!("node-{id}"),
                ipv4: vaddr(id),
                server_id: relay.id,
                active: true,
            })
            .collect(),
        networks: vec![Network {
            id: NetworkId(1),
            name: "home".to_string(),
            peers: ids.iter().map(|&id| PeerId(id)).collect(),
        }],
    }
}

/// Scripted control plane for one node.
pub struct FakeControl {
    peer_id: u64,
    primary: RelayServer,
    lease: Duration,
    graph: Mutex<PeerGraphResponse>,
    /// Number of peer graph pulls served
    pub pulls: AtomicUsize,
    /// Number of credential renewals served
    pub renewals: AtomicUsize,
}

impl FakeControl {
    /// Control plane announcing `graph` and credentials of `lease`.
    pub fn new(peer_id: u64, primary: RelayServer, graph: PeerGraphResponse, lease: Duration) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            primary,
            lease,
            graph: Mutex::new(graph),
            pulls: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
        })
    }

    /// Replace the announced graph.
    pub fn set_graph(&self, graph: PeerGraphResponse) {
        *self.graph.lock().expect("graph lock") = graph;
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn preflight(&self, _os: &str, _hostname: &str) -> Result<PreflightResponse, MeshError> {
        Ok(PreflightResponse {
            id: PeerId(self.peer_id),
            user_id: UserId(USER_ID),
            name: format!("node-{}", self.peer_id),
            ipv4: vaddr(self.peer_id),
            primary_server: self.primary.clone(),
            credential: credential(self.peer_id, self.lease),
            credential_lease: self.lease.as_secs(),
        })
    }

    async fn peer_graph(&self, unique_hash: &str) -> Result<PeerGraphResponse, MeshError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let graph = self.graph.lock().expect("graph lock").clone();
        if !unique_hash.is_empty() && unique_hash == graph.unique_hash {
            return Ok(PeerGraphResponse {
                not_modified: true,
                unique_hash: graph.unique_hash,
                ..PeerGraphResponse::default()
            });
        }
        Ok(graph)
    }

    async fn renew_credential(&self, request: RenewCredentialRequest) -> Result<RenewCredentialResponse, MeshError> {
        if request.credential.is_empty() {
            return Err(MeshError::ControlPlane("empty credential".to_string()));
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(RenewCredentialResponse {
            credential: credential(self.peer_id, self.lease),
            credential_lease: self.lease.as_secs(),
        })
    }
}

/// Device backed by channels. Packets injected by the test are "read" by
/// the driver; packets the driver writes are collected for the test.
pub struct ChannelDevice {
    address: Mutex<Option<Ipv4Addr>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    router: Arc<MemoryRouter>,
}

/// Test side of a [`ChannelDevice`].
pub struct DeviceHandle {
    inject: mpsc::Sender<Vec<u8>>,
    written: mpsc::Receiver<Vec<u8>>,
    device: Arc<ChannelDevice>,
}

impl ChannelDevice {
    /// Device plus the handle driving it.
    pub fn new() -> (Arc<Self>, DeviceHandle) {
        let (inject, inbound) = mpsc::channel(64);
        let (outbound, written) = mpsc::channel(64);
        let device = Arc::new(Self {
            address: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            router: Arc::new(MemoryRouter::new()),
        });
        let handle = DeviceHandle {
            inject,
            written,
            device: device.clone(),
        };
        (device, handle)
    }
}

#[async_trait]
impl Device for ChannelDevice {
    async fn up(&self, address: Ipv4Addr) -> Result<(), MeshError> {
        *self.address.lock().map_err(|_| MeshError::Device("lock".to_string()))? = Some(address);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, MeshError> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MeshError::Device("closed".to_string()))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write(&self, packet: &[u8]) -> Result<usize, MeshError> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| MeshError::Device("closed".to_string()))?;
        Ok(packet.len())
    }

    fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }
}

impl DeviceHandle {
    /// Hand a packet to the driver as if an application sent it.
    pub async fn inject(&self, packet: Vec<u8>) {
        self.inject.send(packet).await.expect("device closed");
    }

    /// Next packet the driver wrote to the device.
    pub async fn next_packet(&mut self) -> Vec<u8> {
        tokio::time::timeout(WAIT_TIMEOUT, self.written.recv())
            .await
            .expect("no packet written to device")
            .expect("device closed")
    }

    /// Next packet written within `timeout`, if any.
    pub async fn try_next_packet(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.written.recv()).await.ok().flatten()
    }

    /// Address assigned by `Device::up`.
    pub fn address(&self) -> Option<Ipv4Addr> {
        *self.device.address.lock().expect("address lock")
    }

    /// Routes installed on the device.
    pub fn routes(&self) -> Vec<Ipv4Addr> {
        self.device.router.routes()
    }
}

/// A running node.
pub struct TestNode {
    /// The node
    pub driver: Arc<Driver>,
    /// Its control plane
    pub control: Arc<FakeControl>,
    /// Its device
    pub device: DeviceHandle,
}

impl TestNode {
    /// Whether this node has an established tunnel to `peer_id`.
    pub fn has_tunnel_to(&self, peer_id: u64) -> bool {
        self.driver
            .mesh()
            .and_then(|mesh| mesh.peer(PeerId(peer_id)))
            .and_then(|peer| peer.tunnel())
            .is_some()
    }
}

/// Fast timers so scenarios settle within a test timeout.
pub fn fast_config() -> DriverConfig {
    DriverConfig {
        tick_interval: Duration::from_millis(100),
        discovery_interval: Duration::from_millis(100),
        hostname: "fixture".to_string(),
        ..DriverConfig::default()
    }
}

/// Preflight and drive node `peer_id` in a mesh of `peers`, all on `relay`.
pub async fn start_node(peer_id: u64, relay: &TestRelay, peers: &[u64], config: DriverConfig) -> TestNode {
    start_node_with_lease(peer_id, relay, peers, config, Duration::from_secs(3600)).await
}

/// Like [`start_node`] with a custom credential lease.
pub async fn start_node_with_lease(
    peer_id: u64,
    relay: &TestRelay,
    peers: &[u64],
    config: DriverConfig,
    lease: Duration,
) -> TestNode {
    let graph = peer_graph(&relay.descriptor, peers, "v1");
    let control = FakeControl::new(peer_id, relay.descriptor.clone(), graph, lease);
    let (device, handle) = ChannelDevice::new();

    let driver = Driver::new(config, control.clone(), device, random_key());
    driver.preflight().await.expect("preflight");
    driver.drive().expect("drive");

    TestNode {
        driver,
        control,
        device: handle,
    }
}
