//! Node driver.
//!
//! Glues the control plane, the virtual device, the relay manager and the
//! mesh manager together:
//!
//! ```text
//!   ControlPlane ──preflight / peer graph / renew──► Driver
//!                                                     │
//!   Device ◄──write loop── dev queue ◄── Forward / Fragment
//!   Device ──read loop──► MeshManager::tunnel(dst).write()
//! ```
//!
//! [`Driver::preflight`] fetches the node identity and builds the managers;
//! [`Driver::drive`] starts the background loops; [`Driver::terminate`]
//! stops them.

use crate::local::LocalPeer;
use crate::manager::{self, MeshManager};
use crate::relay::{self, RelayProvider};
use crate::router::Router;
use crate::summary::Summary;
use crate::tunnel::{FragmentSink, TunnelOptions};
use crate::MeshError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};
use strand_core::message::{Forward, PeerInfo, ProbeResponse, SyncPeer, SyncPurpose};
use strand_core::protocol::{
    Peer, PeerGraphResponse, PreflightResponse, RelayServer, RenewCredentialRequest, RenewCredentialResponse,
};
use strand_core::{DISCOVERY_INTERVAL, MAX_BUFFER_SIZE, Message, PeerId, ServerId};
use strand_crypto::x25519::PrivateKey;
use strand_relay::{Manager, ManagerConfig, ManagerEvent, RelayError, RelayHandler};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// SSDP multicast group; chatter towards it is never tunnelled.
const SSDP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Credentials arrive as base64 with or without padding.
const CREDENTIAL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Control-plane API used by the driver.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register this device and obtain its identity and credential.
    async fn preflight(&self, os: &str, hostname: &str) -> Result<PreflightResponse, MeshError>;

    /// Pull the peer graph. `unique_hash` is the hash of the last graph
    /// applied, empty on the first pull.
    async fn peer_graph(&self, unique_hash: &str) -> Result<PeerGraphResponse, MeshError>;

    /// Exchange the current credential for a fresh one.
    async fn renew_credential(&self, request: RenewCredentialRequest) -> Result<RenewCredentialResponse, MeshError>;
}

/// Virtual network device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Assign the virtual address and bring the device up.
    async fn up(&self, address: Ipv4Addr) -> Result<(), MeshError>;

    /// Read one IP packet.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, MeshError>;

    /// Write one IP packet.
    async fn write(&self, packet: &[u8]) -> Result<usize, MeshError>;

    /// Route table of the device.
    fn router(&self) -> Arc<dyn Router>;
}

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Local UDP port shared by all tunnel endpoints; 0 picks a free port
    pub port: u16,
    /// Interval of relay reconnects and peer probes
    pub tick_interval: Duration,
    /// Peer graph pull interval until the control plane announces one
    pub pull_interval: Duration,
    /// Depth of the queue towards the device
    pub device_queue: usize,
    /// Addresses advertised as UDP endpoints in addition to detected ones
    pub advertise_addresses: Vec<Ipv4Addr>,
    /// Host name reported at preflight
    pub hostname: String,
    /// Discovery round interval of every tunnel
    pub discovery_interval: Duration,
    /// Relay manager settings
    pub relay: ManagerConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: 0,
            tick_interval: Duration::from_secs(5),
            pull_interval: Duration::from_secs(1800),
            device_queue: 512,
            advertise_addresses: Vec::new(),
            hostname: String::new(),
            discovery_interval: DISCOVERY_INTERVAL,
            relay: ManagerConfig::default(),
        }
    }
}

/// Identity shown in the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// Owner
    pub user_id: u64,
    /// Device name
    pub name: String,
    /// Virtual address
    pub ipv4: Ipv4Addr,
}

/// Driver status for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverSummary {
    /// Whether traffic is handled
    pub enabled: bool,
    /// `connected`, `connecting` or `unauthenticated`
    pub status: String,
    /// Node identity, once preflight completed
    pub profile: Option<Profile>,
    /// Mesh state
    pub mesh: Summary,
}

#[derive(Debug, Clone)]
struct CredentialState {
    encoded: String,
    renewed_at: Instant,
    lease: Duration,
}

/// Managers built by preflight.
struct Engine {
    local: LocalPeer,
    port: u16,
    relay: Arc<Manager>,
    mesh: Arc<MeshManager>,
}

/// Node driver
pub struct Driver {
    config: DriverConfig,
    control: Arc<dyn ControlPlane>,
    device: Arc<dyn Device>,
    private_key: PrivateKey,
    engine: OnceLock<Arc<Engine>>,
    credential: Mutex<Option<CredentialState>>,
    primary: RwLock<Option<RelayServer>>,
    external_addr: RwLock<Option<SocketAddr>>,
    running: AtomicBool,
    terminated: AtomicBool,
    enabled: AtomicBool,
    authenticated: AtomicBool,
    primary_connected: AtomicBool,
    dev_tx: mpsc::Sender<Vec<u8>>,
    dev_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Relay and UDP callbacks. Holds the driver weakly so the managers do not
/// keep it alive.
struct Callbacks {
    driver: Weak<Driver>,
}

impl RelayHandler for Callbacks {
    fn on_forward(&self, _server: ServerId, msg: Forward) -> Result<(), RelayError> {
        if let Some(driver) = self.driver.upgrade() {
            if let Err(e) = driver.on_forward(msg) {
                tracing::debug!("Dropping forwarded packet: {}", e);
            }
        }
        Ok(())
    }

    fn on_sync_peer(&self, _server: ServerId, msg: SyncPeer) -> Result<(), RelayError> {
        if let Some(driver) = self.driver.upgrade() {
            let purpose = msg.purpose;
            if let Err(e) = driver.on_sync_peer(msg) {
                tracing::warn!("Handling {:?} failed: {}", purpose, e);
            }
        }
        Ok(())
    }

    fn on_probe_response(&self, _server: ServerId, msg: ProbeResponse) -> Result<(), RelayError> {
        if let Some(driver) = self.driver.upgrade() {
            driver.on_probe_response(msg);
        }
        Ok(())
    }
}

impl FragmentSink for Callbacks {
    fn on_fragment(&self, from: PeerId, packet: Vec<u8>) {
        if let Some(driver) = self.driver.upgrade() {
            if let Err(e) = driver.deliver(packet) {
                tracing::debug!("Dropping packet from peer {}: {}", from, e);
            }
        }
    }
}

impl Driver {
    /// Create a driver. Nothing happens until [`Driver::preflight`].
    #[must_use]
    pub fn new(
        config: DriverConfig,
        control: Arc<dyn ControlPlane>,
        device: Arc<dyn Device>,
        private_key: PrivateKey,
    ) -> Arc<Self> {
        let (dev_tx, dev_rx) = mpsc::channel(config.device_queue.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            control,
            device,
            private_key,
            engine: OnceLock::new(),
            credential: Mutex::new(None),
            primary: RwLock::new(None),
            external_addr: RwLock::new(None),
            running: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            primary_connected: AtomicBool::new(false),
            dev_tx,
            dev_rx: Mutex::new(Some(dev_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn engine(&self) -> Result<Arc<Engine>, MeshError> {
        self.engine
            .get()
            .cloned()
            .ok_or(MeshError::InvalidState("preflight not completed"))
    }

    /// Obtain identity and credential, bring the device up and build the
    /// relay and mesh managers.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane or the device fail, the
    /// credential does not decode, or preflight already ran.
    pub async fn preflight(self: &Arc<Self>) -> Result<(), MeshError> {
        if self.engine.get().is_some() {
            return Err(MeshError::InvalidState("preflight already completed"));
        }

        let response = self
            .control
            .preflight(std::env::consts::OS, &self.config.hostname)
            .await?;
        tracing::info!("Preflight succeeded: peer {} ({})", response.id, response.ipv4);

        let credential = decode_credential(&response.credential)?;
        self.device.up(response.ipv4).await?;
        tracing::info!("Virtual device up with address {}", response.ipv4);

        let port = resolve_port(self.config.port)?;
        let local = LocalPeer::new(
            response.name,
            response.user_id,
            response.id,
            response.ipv4,
            self.private_key.clone(),
        );

        let callbacks = Arc::new(Callbacks {
            driver: Arc::downgrade(self),
        });
        let relay = Manager::new(
            self.config.relay.clone(),
            local.public_key,
            credential,
            response.primary_server.id,
            callbacks.clone(),
        );
        let options = TunnelOptions {
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            discovery_interval: self.config.discovery_interval,
        };
        let mesh = Arc::new(MeshManager::new(
            local.clone(),
            relay.clone() as Arc<dyn RelayProvider>,
            self.device.router(),
            callbacks,
            options,
        ));

        if let Ok(mut state) = self.credential.lock() {
            *state = Some(CredentialState {
                encoded: response.credential,
                renewed_at: Instant::now(),
                lease: Duration::from_secs(response.credential_lease),
            });
        }
        if let Ok(mut primary) = self.primary.write() {
            *primary = Some(response.primary_server);
        }
        self.authenticated.store(true, Ordering::SeqCst);

        let engine = Arc::new(Engine { local, port, relay, mesh });
        self.engine
            .set(engine)
            .map_err(|_| MeshError::InvalidState("preflight already completed"))?;
        tracing::info!("Driver preflight finished");
        Ok(())
    }

    /// Start the background loops.
    ///
    /// # Errors
    ///
    /// Returns an error if preflight has not run or the driver is already
    /// running.
    pub fn drive(self: &Arc<Self>) -> Result<(), MeshError> {
        let engine = self.engine()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MeshError::InvalidState("driver already running"));
        }
        let dev_rx = self
            .dev_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(MeshError::InvalidState("device queue already taken"))?;
        let events = engine
            .relay
            .take_events()
            .ok_or(MeshError::InvalidState("relay events already taken"))?;

        let handles = vec![
            tokio::spawn(self.clone().device_read_loop(engine.clone(), self.shutdown.subscribe())),
            tokio::spawn(self.clone().device_write_loop(dev_rx, self.shutdown.subscribe())),
            tokio::spawn(self.clone().pull_loop(engine.clone(), self.shutdown.subscribe())),
            tokio::spawn(self.clone().events_loop(engine.clone(), events, self.shutdown.subscribe())),
            tokio::spawn(self.clone().renewal_loop(engine, self.shutdown.subscribe())),
        ];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        tracing::info!("All background tasks running");
        Ok(())
    }

    async fn device_read_loop(self: Arc<Self>, engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_BUFFER_SIZE];

        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = self.device.read(&mut buf) => read,
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Device read failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            if !self.is_enabled() {
                continue;
            }
            self.route_packet(&engine, &buf[..n]);
        }
        tracing::info!("Device read task stopped");
    }

    /// Send a packet read from the device towards its destination.
    fn route_packet(&self, engine: &Engine, packet: &[u8]) {
        let Some(destination) = ipv4_destination(packet) else {
            tracing::trace!("Ignoring non IPv4 packet of {} bytes", packet.len());
            return;
        };
        if destination == SSDP {
            return;
        }
        if destination == engine.local.ipv4 {
            if let Err(e) = self.deliver(packet.to_vec()) {
                tracing::debug!("Loopback packet dropped: {}", e);
            }
            return;
        }

        let Some(tunnel) = engine.mesh.tunnel(destination) else {
            tracing::trace!("No tunnel for {}", destination);
            return;
        };
        if let Err(e) = tunnel.write(packet) {
            tracing::debug!("Write to {} failed: {}", destination, e);
        }
    }

    async fn device_write_loop(self: Arc<Self>, mut dev_rx: mpsc::Receiver<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let packet = tokio::select! {
                _ = shutdown.changed() => break,
                packet = dev_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            if !self.is_enabled() {
                continue;
            }
            if let Err(e) = self.device.write(&packet).await {
                tracing::error!("Device write failed: {}", e);
            }
        }
        tracing::info!("Device write task stopped");
    }

    async fn pull_loop(self: Arc<Self>, engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
        let mut pull_interval = self.config.pull_interval;
        let mut unique_hash = String::new();
        let pull = tokio::time::sleep(Duration::ZERO);
        let tick = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(pull, tick);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                () = &mut pull => {
                    let result = self.control.peer_graph(&unique_hash).await;
                    if let Ok(graph) = &result {
                        if graph.update_interval > 0 {
                            pull_interval = Duration::from_secs(graph.update_interval);
                        }
                    }
                    pull.as_mut().reset(tokio::time::Instant::now() + pull_interval);

                    let graph = match result {
                        Ok(graph) => graph,
                        Err(e) => {
                            tracing::error!("Peer graph pull failed: {}", e);
                            continue;
                        }
                    };
                    if graph.not_modified {
                        continue;
                    }
                    unique_hash.clone_from(&graph.unique_hash);
                    self.apply_peer_graph(&engine, graph).await;
                }
                () = &mut tick => {
                    engine.relay.tick().await;
                    engine.mesh.tick();
                    tick.as_mut().reset(tokio::time::Instant::now() + self.config.tick_interval);
                }
            }
        }
        tracing::info!("Peer graph task stopped");
    }

    async fn apply_peer_graph(&self, engine: &Engine, graph: PeerGraphResponse) {
        let Some(primary_id) = find_primary_server(&graph.peers, engine.local.peer_id) else {
            tracing::error!("Peer graph does not list this node, cannot find its primary server");
            return;
        };
        let Some(primary) = graph.relay_servers.iter().find(|s| s.id == primary_id).cloned() else {
            tracing::error!("Peer graph does not describe primary relay server {}", primary_id);
            return;
        };

        engine.relay.set_primary(primary_id);
        if let Ok(mut current) = self.primary.write() {
            *current = Some(primary);
        }
        engine.relay.update(&graph.relay_servers).await;
        if let Err(e) = engine.mesh.update(graph.networks, graph.peers) {
            tracing::error!("Applying peer graph failed: {}", e);
        }
        self.refresh_endpoints(engine).await;
    }

    async fn events_loop(
        self: Arc<Self>,
        engine: Arc<Engine>,
        mut events: mpsc::Receiver<ManagerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if event.server_id() != engine.relay.primary() {
                continue;
            }
            let connected = matches!(event, ManagerEvent::ClientConnected(_));
            self.primary_connected.store(connected, Ordering::SeqCst);
            tracing::info!("Primary relay server {} connected: {}", event.server_id(), connected);
        }
        tracing::info!("Relay events task stopped");
    }

    async fn renewal_loop(self: Arc<Self>, engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = self
                .credential
                .lock()
                .ok()
                .and_then(|c| c.as_ref().and_then(|c| renewal_delay(c.renewed_at, c.lease, Instant::now())));
            let Some(delay) = delay else {
                tracing::error!("Credential expired before it could be renewed");
                self.authenticated.store(false, Ordering::SeqCst);
                engine.relay.stop();
                break;
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(delay) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.renew_credential(&engine).await {
                tracing::error!("Credential renewal failed: {}", e);
            }
        }
        tracing::info!("Credential renewal task stopped");
    }

    /// Exchange the credential for a fresh one and hand it to the relay
    /// manager.
    async fn renew_credential(&self, engine: &Engine) -> Result<(), MeshError> {
        let encoded = self
            .credential
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.encoded.clone()))
            .ok_or(MeshError::InvalidState("no credential"))?;

        let response = self
            .control
            .renew_credential(RenewCredentialRequest { credential: encoded })
            .await?;
        let raw = decode_credential(&response.credential)?;

        if let Ok(mut state) = self.credential.lock() {
            *state = Some(CredentialState {
                encoded: response.credential,
                renewed_at: Instant::now(),
                lease: Duration::from_secs(response.credential_lease),
            });
        }
        engine.relay.set_credential(raw);
        tracing::info!("Credential renewed, lease {}s", response.credential_lease);
        Ok(())
    }

    fn on_forward(&self, forward: Forward) -> Result<(), MeshError> {
        let engine = self.engine()?;
        if forward.dst_peer_id != engine.local.peer_id {
            return Err(MeshError::Misrouted(forward.dst_peer_id));
        }
        let peer = engine
            .mesh
            .peer(forward.src_peer_id)
            .ok_or(MeshError::PeerNotFound(forward.src_peer_id))?;
        let tunnel = peer.tunnel().ok_or(MeshError::NoTunnel(forward.src_peer_id))?;
        let packet = tunnel.cipher().open(u64::from(forward.nonce), &forward.fragment)?;
        self.deliver(packet)
    }

    fn on_sync_peer(&self, sync: SyncPeer) -> Result<(), MeshError> {
        let engine = self.engine()?;
        if sync.dst_peer_id != engine.local.peer_id {
            return Err(MeshError::Misrouted(sync.dst_peer_id));
        }
        manager::check_sender(&sync)?;
        tracing::debug!("Sync {:?} from {:?}", sync.purpose, sync.peer.as_ref().map(|p| p.peer_id));

        match sync.purpose {
            SyncPurpose::Catchup => {
                // Connecting to the sender's primary server may block; keep
                // the relay client's serve task free.
                tokio::spawn(async move {
                    let server = sync.peer.as_ref().and_then(|p| p.primary_server.clone());
                    if let Some(server) = server {
                        engine.relay.add_server(server).await;
                    }
                    if let Err(e) = engine.mesh.peer_catchup(sync) {
                        tracing::error!("Peer catchup failed: {}", e);
                    }
                });
                Ok(())
            }
            SyncPurpose::CatchupAck => engine.mesh.peer_catchup_ack(sync),
            SyncPurpose::PairRequest => {
                let Some(from) = sync.peer.as_ref().map(|p| p.peer_id) else {
                    return Ok(());
                };
                if let Err(e) = engine.mesh.peer_endpoints(sync) {
                    tracing::debug!("Pair request from peer {}: {}", from, e);
                }
                self.answer_pair_request(&engine, from)
            }
            SyncPurpose::PairResponse | SyncPurpose::EndpointsChanged => engine.mesh.peer_endpoints(sync),
        }
    }

    fn answer_pair_request(&self, engine: &Engine, from: PeerId) -> Result<(), MeshError> {
        let server = engine
            .mesh
            .peer(from)
            .map_or_else(|| engine.relay.primary(), |p| p.server_id());
        let sender = relay::route(&*engine.relay, server).ok_or(MeshError::NoRelay(from))?;
        let response = SyncPeer {
            src_peer_id: engine.local.peer_id,
            dst_peer_id: from,
            purpose: SyncPurpose::PairResponse,
            peer: Some(PeerInfo::from_id(engine.local.peer_id)),
            endpoints: engine.mesh.local_endpoints(),
        };
        sender.send(Message::SyncPeer(response))?;
        Ok(())
    }

    fn on_probe_response(&self, response: ProbeResponse) {
        match self.engine() {
            Ok(engine) => engine.mesh.probe_result(response),
            Err(e) => tracing::debug!("Probe response ignored: {}", e),
        }
    }

    /// Queue a decrypted packet for the device.
    fn deliver(&self, packet: Vec<u8>) -> Result<(), MeshError> {
        self.dev_tx.try_send(packet).map_err(|_| MeshError::QueueFull)
    }

    /// The node's public UDP address, as seen by a STUN server, changed.
    pub async fn on_external_address_changed(&self, address: SocketAddr) {
        tracing::info!("External address changed to {}", address);
        if let Ok(mut current) = self.external_addr.write() {
            *current = Some(address);
        }
        if let Ok(engine) = self.engine() {
            self.refresh_endpoints(&engine).await;
        }
    }

    /// Recompute the advertised endpoints and push them to the mesh if they
    /// changed.
    async fn refresh_endpoints(&self, engine: &Engine) {
        let endpoints = self.local_endpoints(engine).await;
        if endpoints != engine.mesh.local_endpoints() {
            tracing::info!("Advertising endpoints {:?}", endpoints);
            engine.mesh.sync_endpoints(endpoints);
        }
    }

    async fn local_endpoints(&self, engine: &Engine) -> Vec<String> {
        let mut endpoints = Vec::new();
        if let Some(external) = self.external_addr.read().ok().and_then(|a| *a) {
            endpoints.push(external.to_string());
        }

        let mut addresses = self.config.advertise_addresses.clone();
        let primary = self.primary.read().ok().and_then(|p| p.clone());
        if let Some(primary) = primary {
            if let Some(address) = outbound_address(&primary).await {
                addresses.push(address);
            }
        }
        addresses.retain(|a| *a != engine.local.ipv4 && !a.is_unspecified());
        addresses.sort_unstable();
        addresses.dedup();

        endpoints.extend(addresses.into_iter().map(|a| format!("{}:{}", a, engine.port)));
        endpoints
    }

    /// Resume handling traffic.
    pub fn enable(&self) {
        tracing::info!("Driver enabled");
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Drop all traffic until [`Driver::enable`].
    pub fn disable(&self) {
        tracing::info!("Driver disabled, dropping all traffic");
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether traffic is handled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the credential is still valid.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the primary relay server is connected.
    #[must_use]
    pub fn is_primary_connected(&self) -> bool {
        self.primary_connected.load(Ordering::SeqCst)
    }

    /// Mesh manager, once preflight completed.
    #[must_use]
    pub fn mesh(&self) -> Option<Arc<MeshManager>> {
        self.engine.get().map(|e| e.mesh.clone())
    }

    /// Relay manager, once preflight completed.
    #[must_use]
    pub fn relay(&self) -> Option<Arc<Manager>> {
        self.engine.get().map(|e| e.relay.clone())
    }

    /// This node, once preflight completed.
    #[must_use]
    pub fn local(&self) -> Option<LocalPeer> {
        self.engine.get().map(|e| e.local.clone())
    }

    /// Status for display.
    #[must_use]
    pub fn summarize(&self) -> DriverSummary {
        let status = if !self.is_authenticated() && self.engine.get().is_some() {
            "unauthenticated"
        } else if self.is_primary_connected() {
            "connected"
        } else {
            "connecting"
        };

        let engine = self.engine.get();
        let mesh = match engine {
            Some(engine) if self.running.load(Ordering::SeqCst) => (*engine.mesh.summarize()).clone(),
            _ => Summary::default(),
        };
        DriverSummary {
            enabled: self.is_enabled(),
            status: status.to_string(),
            profile: engine.map(|e| Profile {
                user_id: e.local.user_id.0,
                name: e.local.name.clone(),
                ipv4: e.local.ipv4,
            }),
            mesh,
        }
    }

    /// Stop every background task and close all connections.
    pub async fn terminate(&self) {
        if !self.running.load(Ordering::SeqCst) || self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        if let Ok(engine) = self.engine() {
            engine.relay.stop();
            engine.mesh.close();
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Driver terminated");
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("local", &self.engine.get().map(|e| e.local.peer_id))
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Primary relay server of `me` in a peer list sorted by id.
#[must_use]
pub fn find_primary_server(peers: &[Peer], me: PeerId) -> Option<ServerId> {
    peers
        .binary_search_by_key(&me, |p| p.id)
        .ok()
        .map(|i| peers[i].server_id)
}

/// Destination of an IPv4 packet.
#[must_use]
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Decode a base64 credential, padded or not.
///
/// # Errors
///
/// Returns [`MeshError::Credential`] if the text is not base64.
pub fn decode_credential(text: &str) -> Result<Vec<u8>, MeshError> {
    CREDENTIAL_BASE64
        .decode(text.trim())
        .map_err(|e| MeshError::Credential(e.to_string()))
}

/// Wait before the next renewal: half the remaining lease, at least one
/// second. `None` once the lease has run out.
#[must_use]
pub fn renewal_delay(renewed_at: Instant, lease: Duration, now: Instant) -> Option<Duration> {
    let expires_at = renewed_at + lease;
    if now >= expires_at {
        return None;
    }
    Some((expires_at - now).div_f64(2.0).max(Duration::from_secs(1)))
}

fn resolve_port(port: u16) -> Result<u16, MeshError> {
    if port != 0 {
        return Ok(port);
    }
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(probe.local_addr()?.port())
}

/// Address of the interface that routes towards `server`. No packet is
/// sent.
async fn outbound_address(server: &RelayServer) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(server.address()).await.ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(address) if !address.is_loopback() && !address.is_unspecified() => Some(address),
        _ => None,
    }
}
