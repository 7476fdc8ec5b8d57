//! Mesh manager.
//!
//! Owns the peer table built from the control-plane peer graph and drives
//! the probe and catchup exchanges that establish a tunnel per peer:
//!
//! ```text
//!   A                       relay                       B
//!   │── ProbeRequest [B] ────►│                          │
//!   │◄── ProbeResponse online ┤                          │
//!   │── SyncPeer Catchup ─────┼─────────────────────────►│ derive cipher, tunnel
//!   │◄────────────────────────┼──── SyncPeer CatchupAck ─│
//!   derive cipher, tunnel
//! ```

use crate::local::LocalPeer;
use crate::peer::Peer;
use crate::relay::{self, RelayProvider};
use crate::router::{Router, RouterConfig};
use crate::summary::{DeviceSummary, NetworkSummary, State, Summary};
use crate::tunnel::{FragmentSink, Tunnel, TunnelOptions};
use crate::MeshError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use strand_core::message::{NetworkRef, PeerInfo, ProbeRequest, ProbeResponse, SyncPeer, SyncPurpose};
use strand_core::protocol::{self, Network};
use strand_core::{Message, NetworkId, PeerId, ServerId};
use strand_crypto::aead::TunnelCipher;
use strand_crypto::x25519::PublicKey;

#[derive(Debug, Default)]
struct PeerTable {
    by_id: HashMap<PeerId, Arc<Peer>>,
    by_addr: HashMap<Ipv4Addr, Arc<Peer>>,
}

/// Mesh manager
pub struct MeshManager {
    local: LocalPeer,
    relay: Arc<dyn RelayProvider>,
    router: Arc<dyn Router>,
    sink: Arc<dyn FragmentSink>,
    tunnel_options: TunnelOptions,
    peers: RwLock<PeerTable>,
    networks: RwLock<Vec<Network>>,
    self_networks: RwLock<Vec<NetworkRef>>,
    local_endpoints: RwLock<Vec<String>>,
    generation: AtomicU64,
    summary: Mutex<Option<(Vec<PeerId>, Arc<Summary>)>>,
}

impl MeshManager {
    /// Create a manager with an empty peer table.
    #[must_use]
    pub fn new(
        local: LocalPeer,
        relay: Arc<dyn RelayProvider>,
        router: Arc<dyn Router>,
        sink: Arc<dyn FragmentSink>,
        tunnel_options: TunnelOptions,
    ) -> Self {
        Self {
            local,
            relay,
            router,
            sink,
            tunnel_options,
            peers: RwLock::new(PeerTable::default()),
            networks: RwLock::new(Vec::new()),
            self_networks: RwLock::new(Vec::new()),
            local_endpoints: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            summary: Mutex::new(None),
        }
    }

    /// This node.
    #[must_use]
    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    fn mark_changed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Apply a peer graph.
    ///
    /// Existing [`Peer`] objects survive so their probe, catchup and tunnel
    /// state is kept; peers missing from `peers` are closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the router rejects the new table.
    pub fn update(&self, networks: Vec<Network>, peers: Vec<protocol::Peer>) -> Result<(), MeshError> {
        tracing::debug!("Updating mesh with {} peers in {} networks", peers.len(), networks.len());

        let refs = networks
            .iter()
            .map(|n| NetworkRef {
                id: n.id,
                name: n.name.clone(),
            })
            .collect();
        if let Ok(mut current) = self.self_networks.write() {
            *current = refs;
        }
        if let Ok(mut current) = self.networks.write() {
            *current = networks;
        }

        let mut config = RouterConfig::new(self.local.ipv4);
        let removed = {
            let mut table = self
                .peers
                .write()
                .map_err(|_| MeshError::InvalidState("peer table lock poisoned"))?;

            let mut next = PeerTable::default();
            for info in peers {
                let id = info.id;
                let ipv4 = info.ipv4;
                let server = info.server_id;
                let peer = match table.by_id.get(&id) {
                    Some(existing) => {
                        existing.set_info(info);
                        if let Some(tunnel) = existing.tunnel() {
                            tunnel.set_peer_server(server);
                        }
                        existing.clone()
                    }
                    None => Arc::new(Peer::new(info)),
                };
                if id != self.local.peer_id {
                    config.routes.push(ipv4);
                }
                next.by_addr.insert(ipv4, peer.clone());
                next.by_id.insert(id, peer);
            }

            let removed: Vec<Arc<Peer>> = table
                .by_id
                .iter()
                .filter(|(id, _)| !next.by_id.contains_key(id))
                .map(|(_, p)| p.clone())
                .collect();
            *table = next;
            removed
        };

        for peer in removed {
            tracing::info!("Peer {} left the mesh", peer.id());
            peer.close();
        }

        self.router.set(config)?;
        self.mark_changed();
        self.probe_peers();
        Ok(())
    }

    /// Periodic work: probe peers that are due.
    pub fn tick(&self) {
        self.probe_peers();
    }

    /// Send one `ProbeRequest` per relay server for the peers due a probe.
    pub fn probe_peers(&self) {
        let now = Instant::now();
        let mut groups: BTreeMap<ServerId, Vec<Arc<Peer>>> = BTreeMap::new();
        for peer in self.peers() {
            if peer.id() == self.local.peer_id || !peer.is_need_probe_at(now) {
                continue;
            }
            groups.entry(peer.server_id()).or_default().push(peer);
        }

        for (server, peers) in groups {
            let Some(sender) = self.relay.sender(server) else {
                tracing::debug!("Relay server {} not connected, skipping probe of {} peers", server, peers.len());
                continue;
            };
            let request = ProbeRequest {
                peers: peers.iter().map(|p| p.id()).collect(),
            };
            if let Err(e) = sender.send(Message::ProbeRequest(request)) {
                tracing::debug!("Probe via relay server {} failed: {}", server, e);
                continue;
            }
            for peer in &peers {
                peer.set_last_probe_request_at(now);
            }
        }
    }

    /// Apply a probe answer and send catchups to online peers that need one.
    pub fn probe_result(&self, response: ProbeResponse) {
        let mut catchup = Vec::new();
        for id in &response.online {
            let Some(peer) = self.peer(*id) else {
                tracing::warn!("Probe answer for unknown peer {}", id);
                continue;
            };
            peer.set_probe_status(true);
            if peer.is_need_catchup() {
                catchup.push(peer);
            }
        }
        for id in &response.offline {
            match self.peer(*id) {
                Some(peer) => peer.set_probe_status(false),
                None => tracing::warn!("Probe answer for unknown peer {}", id),
            }
        }
        if catchup.is_empty() {
            return;
        }

        let Some(info) = self.local_info() else {
            tracing::error!("Primary relay server unknown, cannot introduce this node");
            return;
        };
        for peer in catchup {
            let Some(sender) = self.relay.sender(peer.server_id()) else {
                continue;
            };
            let sync = SyncPeer {
                src_peer_id: self.local.peer_id,
                dst_peer_id: peer.id(),
                purpose: SyncPurpose::Catchup,
                peer: Some(info.clone()),
                endpoints: Vec::new(),
            };
            if let Err(e) = sender.send(Message::SyncPeer(sync)) {
                tracing::error!("Catchup to peer {} failed: {}", peer.id(), e);
                continue;
            }
            tracing::debug!("Catchup sent to peer {}", peer.id());
            peer.set_last_send_catchup_at(Instant::now());
        }
    }

    /// Full description of this node, as sent in a catchup.
    fn local_info(&self) -> Option<PeerInfo> {
        let primary = self.relay.primary_descriptor()?;
        Some(PeerInfo {
            user_id: self.local.user_id,
            peer_id: self.local.peer_id,
            ipv4: Some(self.local.ipv4),
            name: self.local.name.clone(),
            public_key: self.local.public_key.to_bytes().to_vec(),
            primary_server: Some(primary),
            networks: self.self_networks.read().map(|n| n.clone()).unwrap_or_default(),
        })
    }

    fn new_tunnel(&self, peer_id: PeerId, server: ServerId, public_key: &[u8]) -> Result<Arc<Tunnel>, MeshError> {
        let remote = PublicKey::from_slice(public_key)?;
        let cipher = TunnelCipher::derive(&self.local.private_key, &remote)?;
        let tunnel = Tunnel::new(
            self.local.peer_id,
            peer_id,
            server,
            cipher,
            self.relay.clone(),
            self.sink.clone(),
            self.tunnel_options.clone(),
        );
        tunnel.set_local_endpoints(self.local_endpoints());
        Ok(tunnel)
    }

    /// Handle a catchup from a peer: learn it if unknown, build the tunnel
    /// and acknowledge.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer's key or address is invalid, the route
    /// cannot be added or the acknowledgement cannot be sent.
    pub fn peer_catchup(&self, sync: SyncPeer) -> Result<(), MeshError> {
        check_sender(&sync)?;
        let Some(info) = sync.peer else {
            tracing::debug!("Catchup without sender description ignored");
            return Ok(());
        };
        let peer_id = info.peer_id;
        let server = info
            .primary_server
            .as_ref()
            .map_or_else(|| self.relay.primary_server(), |s| s.id);

        let (peer, route) = {
            let mut table = self
                .peers
                .write()
                .map_err(|_| MeshError::InvalidState("peer table lock poisoned"))?;
            match table.by_id.get(&peer_id) {
                Some(peer) => (peer.clone(), None),
                None => {
                    let ipv4 = info.ipv4.ok_or(MeshError::InvalidAddress(peer_id))?;
                    let peer = Arc::new(Peer::new(protocol::Peer {
                        id: peer_id,
                        user_id: info.user_id,
                        name: info.name.clone(),
                        ipv4,
                        server_id: server,
                        active: true,
                    }));
                    peer.set_probe_status(true);
                    table.by_id.insert(peer_id, peer.clone());
                    table.by_addr.insert(ipv4, peer.clone());
                    tracing::info!("Learned peer {} ({}) from catchup", peer_id, ipv4);
                    (peer, Some(ipv4))
                }
            }
        };

        let tunnel = self.new_tunnel(peer_id, server, &info.public_key)?;
        peer.set_catchup_at(Instant::now());
        peer.set_tunnel(tunnel);

        if let Some(ipv4) = route {
            self.router.add(RouterConfig {
                local_address: self.local.ipv4,
                routes: vec![ipv4],
            })?;
        }

        self.update_network_topology_with_peer(peer_id, &info.networks);
        self.mark_changed();

        let sender = self.relay.sender(server).ok_or(MeshError::NoRelay(peer_id))?;
        let ack = SyncPeer {
            src_peer_id: self.local.peer_id,
            dst_peer_id: peer_id,
            purpose: SyncPurpose::CatchupAck,
            peer: Some(PeerInfo {
                public_key: self.local.public_key.to_bytes().to_vec(),
                ..PeerInfo::from_id(self.local.peer_id)
            }),
            endpoints: Vec::new(),
        };
        sender.send(Message::SyncPeer(ack))?;
        Ok(())
    }

    /// Make the network table agree with the memberships `peer_id`
    /// advertised: add it where it joined, drop it where it left.
    pub(crate) fn update_network_topology_with_peer(&self, peer_id: PeerId, advertised: &[NetworkRef]) {
        let Ok(mut networks) = self.networks.write() else {
            return;
        };
        let wanted: HashSet<NetworkId> = advertised.iter().map(|n| n.id).collect();

        for network in networks.iter_mut() {
            if wanted.contains(&network.id) {
                if !network.peers.contains(&peer_id) {
                    network.peers.push(peer_id);
                }
            } else {
                network.peers.retain(|p| *p != peer_id);
            }
        }

        for advertised in advertised {
            if networks.iter().any(|n| n.id == advertised.id) {
                continue;
            }
            networks.push(Network {
                id: advertised.id,
                name: advertised.name.clone(),
                peers: vec![peer_id],
            });
        }
    }

    /// Handle the answer to our catchup.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown or its key is invalid.
    pub fn peer_catchup_ack(&self, sync: SyncPeer) -> Result<(), MeshError> {
        check_sender(&sync)?;
        let Some(info) = sync.peer else {
            return Ok(());
        };
        let peer = self.peer(info.peer_id).ok_or(MeshError::PeerNotFound(info.peer_id))?;
        let tunnel = self.new_tunnel(info.peer_id, peer.server_id(), &info.public_key)?;
        peer.set_tunnel(tunnel);
        peer.set_catchup_at(Instant::now());
        self.mark_changed();
        tracing::info!("Tunnel to peer {} established", info.peer_id);
        Ok(())
    }

    /// Hand a peer's advertised endpoints to its tunnel.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown or has no tunnel yet.
    pub fn peer_endpoints(&self, sync: SyncPeer) -> Result<(), MeshError> {
        check_sender(&sync)?;
        let Some(info) = sync.peer else {
            return Ok(());
        };
        let peer = self.peer(info.peer_id).ok_or(MeshError::PeerNotFound(info.peer_id))?;
        let tunnel = peer.tunnel().ok_or(MeshError::NoTunnel(info.peer_id))?;
        tunnel.set_remote_endpoints(sync.endpoints);
        Ok(())
    }

    /// This node's endpoints changed: update every tunnel and tell peers
    /// that are already discovering.
    pub fn sync_endpoints(&self, endpoints: Vec<String>) {
        if let Ok(mut current) = self.local_endpoints.write() {
            current.clone_from(&endpoints);
        }

        for peer in self.peers() {
            let Some(tunnel) = peer.tunnel() else {
                continue;
            };
            tunnel.set_local_endpoints(endpoints.clone());
            if !tunnel.is_disco() {
                continue;
            }

            let Some(sender) = relay::route(self.relay.as_ref(), peer.server_id()) else {
                tracing::error!("No relay server to reach peer {}", peer.id());
                continue;
            };
            let sync = SyncPeer {
                src_peer_id: self.local.peer_id,
                dst_peer_id: peer.id(),
                purpose: SyncPurpose::EndpointsChanged,
                peer: Some(PeerInfo::from_id(self.local.peer_id)),
                endpoints: endpoints.clone(),
            };
            if let Err(e) = sender.send(Message::SyncPeer(sync)) {
                tracing::error!("Endpoint update to peer {} failed: {}", peer.id(), e);
            }
        }
    }

    /// Endpoints this node advertises.
    #[must_use]
    pub fn local_endpoints(&self) -> Vec<String> {
        self.local_endpoints.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Tunnel to the peer owning `destination`.
    #[must_use]
    pub fn tunnel(&self, destination: Ipv4Addr) -> Option<Arc<Tunnel>> {
        let peer = self.peers.read().ok()?.by_addr.get(&destination).cloned()?;
        peer.tunnel()
    }

    /// Peer by id.
    #[must_use]
    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().ok()?.by_id.get(&id).cloned()
    }

    /// All known peers ordered by id.
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .map(|t| t.by_id.values().cloned().collect())
            .unwrap_or_default();
        peers.sort_by_key(|p| p.id());
        peers
    }

    /// Snapshot of the network table.
    #[must_use]
    pub fn networks(&self) -> Vec<Network> {
        self.networks.read().map(|n| n.clone()).unwrap_or_default()
    }

    /// Devices and networks with their path state. Cached until the peer
    /// table or a peer's path changes.
    #[must_use]
    pub fn summarize(&self) -> Arc<Summary> {
        let generation = self.generation.load(Ordering::SeqCst);
        let peers = self.peers();
        // Path state changes without bumping the generation.
        let direct: Vec<PeerId> = peers
            .iter()
            .filter(|p| p.tunnel().is_some_and(|t| t.reachable_endpoint().is_some()))
            .map(|p| p.id())
            .collect();
        if let Ok(cached) = self.summary.lock() {
            if let Some((_, summary)) = cached
                .as_ref()
                .filter(|(d, s)| s.generation == generation && *d == direct)
            {
                return summary.clone();
            }
        }

        let device = |peer: &Peer| {
            let info = peer.info();
            let status = if direct.contains(&peer.id()) { State::P2P } else { State::Relay };
            DeviceSummary {
                name: info.name,
                ipv4: info.ipv4,
                status,
            }
        };

        let my_devices = peers
            .iter()
            .filter(|p| p.user_id() == self.local.user_id)
            .map(|p| device(p))
            .collect();

        let by_id: HashMap<PeerId, &Arc<Peer>> = peers.iter().map(|p| (p.id(), p)).collect();
        let networks = self
            .networks()
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id,
                name: n.name,
                devices: n
                    .peers
                    .iter()
                    .filter_map(|id| by_id.get(id))
                    .map(|p| device(p))
                    .collect(),
            })
            .collect();

        let summary = Arc::new(Summary {
            generation,
            my_devices,
            networks,
        });
        if let Ok(mut cached) = self.summary.lock() {
            *cached = Some((direct, summary.clone()));
        }
        summary
    }

    /// Close every peer's tunnel.
    pub fn close(&self) {
        for peer in self.peers() {
            peer.close();
        }
    }
}

/// Refuse a sync whose sender description names another peer than the
/// relay-attested sender.
///
/// # Errors
///
/// Returns [`MeshError::SenderMismatch`] if the ids differ.
pub fn check_sender(sync: &SyncPeer) -> Result<(), MeshError> {
    match &sync.peer {
        Some(info) if info.peer_id != sync.src_peer_id => Err(MeshError::SenderMismatch {
            sender: sync.src_peer_id,
            claimed: info.peer_id,
        }),
        _ => Ok(()),
    }
}

impl std::fmt::Debug for MeshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshManager")
            .field("peer_id", &self.local.peer_id)
            .field("peers", &self.peers().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::StaticRelays;
    use crate::router::MemoryRouter;
    use rand_core::OsRng;
    use strand_core::UserId;
    use strand_crypto::x25519::PrivateKey;

    struct Discard;

    impl FragmentSink for Discard {
        fn on_fragment(&self, _: PeerId, _: Vec<u8>) {}
    }

    fn local(peer: u64) -> LocalPeer {
        LocalPeer::new(
            format!("node-{peer}"),
            UserId(1),
            PeerId(peer),
            Ipv4Addr::new(10, 0, 0, peer as u8),
            PrivateKey::generate(&mut OsRng),
        )
    }

    fn manager(relays: Arc<StaticRelays>) -> (MeshManager, Arc<MemoryRouter>) {
        let router = Arc::new(MemoryRouter::new());
        let manager = MeshManager::new(local(1), relays, router.clone(), Arc::new(Discard), TunnelOptions::default());
        (manager, router)
    }

    fn peer(id: u64, user: u64, server: u64) -> protocol::Peer {
        protocol::Peer {
            id: PeerId(id),
            user_id: UserId(user),
            name: format!("node-{id}"),
            ipv4: Ipv4Addr::new(10, 0, 0, id as u8),
            server_id: ServerId(server),
            active: true,
        }
    }

    fn network(id: u64, peers: &[u64]) -> Network {
        Network {
            id: NetworkId(id),
            name: format!("net-{id}"),
            peers: peers.iter().map(|p| PeerId(*p)).collect(),
        }
    }

    fn refs(ids: &[u64]) -> Vec<NetworkRef> {
        ids.iter()
            .map(|id| NetworkRef {
                id: NetworkId(*id),
                name: format!("net-{id}"),
            })
            .collect()
    }

    fn members(manager: &MeshManager, network: u64) -> Vec<u64> {
        manager
            .networks()
            .into_iter()
            .find(|n| n.id == NetworkId(network))
            .map(|n| n.peers.into_iter().map(|p| p.0).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_topology_moves_peer_between_networks() {
        let (manager, _) = manager(StaticRelays::new(ServerId(1), &[]));
        manager
            .update(
                vec![network(1, &[1, 2, 3, 42, 100]), network(2, &[1, 2]), network(4, &[42])],
                vec![],
            )
            .unwrap();

        manager.update_network_topology_with_peer(PeerId(42), &refs(&[2, 3, 4]));

        assert_eq!(members(&manager, 1), vec![1, 2, 3, 100]);
        assert_eq!(members(&manager, 2), vec![1, 2, 42]);
        assert_eq!(members(&manager, 3), vec![42]);
        assert_eq!(members(&manager, 4), vec![42]);
    }

    #[test]
    fn test_topology_from_empty_table() {
        let (manager, _) = manager(StaticRelays::new(ServerId(1), &[]));
        manager.update_network_topology_with_peer(PeerId(42), &refs(&[1, 2, 3]));

        for id in [1, 2, 3] {
            assert_eq!(members(&manager, id), vec![42]);
        }
        assert_eq!(manager.networks()[0].name, "net-1");
    }

    #[test]
    fn test_topology_peer_left_everything() {
        let (manager, _) = manager(StaticRelays::new(ServerId(1), &[]));
        manager
            .update(
                vec![network(1, &[1, 2, 3, 42, 100]), network(2, &[42]), network(3, &[41])],
                vec![],
            )
            .unwrap();

        manager.update_network_topology_with_peer(PeerId(42), &[]);

        assert_eq!(members(&manager, 1), vec![1, 2, 3, 100]);
        // Emptied networks stay listed.
        assert_eq!(manager.networks().len(), 3);
        assert!(members(&manager, 2).is_empty());
        assert_eq!(members(&manager, 3), vec![41]);
    }

    #[test]
    fn test_update_routes_and_probes() {
        let relays = StaticRelays::new(ServerId(1), &[ServerId(1), ServerId(2)]);
        let (manager, router) = manager(relays.clone());

        manager
            .update(vec![], vec![peer(1, 1, 1), peer(2, 1, 1), peer(3, 2, 2), peer(4, 2, 1)])
            .unwrap();

        // Self is not routed.
        assert_eq!(
            router.routes(),
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 4)]
        );

        let probes: Vec<(ServerId, Vec<PeerId>)> = relays
            .sent()
            .into_iter()
            .filter_map(|(server, msg)| match msg {
                Message::ProbeRequest(req) => Some((server, req.peers)),
                _ => None,
            })
            .collect();
        assert_eq!(
            probes,
            vec![(ServerId(1), vec![PeerId(2), PeerId(4)]), (ServerId(2), vec![PeerId(3)])]
        );

        // Recently probed peers are skipped.
        manager.tick();
        assert_eq!(relays.sent().len(), 2);
    }

    #[test]
    fn test_update_keeps_and_closes_peers() {
        let (manager, router) = manager(StaticRelays::new(ServerId(1), &[]));
        manager.update(vec![], vec![peer(2, 1, 1), peer(3, 1, 1)]).unwrap();
        let kept = manager.peer(PeerId(2)).unwrap();

        let mut moved = peer(2, 1, 7);
        moved.name = "renamed".into();
        manager.update(vec![], vec![moved]).unwrap();

        let after = manager.peer(PeerId(2)).unwrap();
        assert!(Arc::ptr_eq(&kept, &after));
        assert_eq!(after.server_id(), ServerId(7));
        assert_eq!(after.info().name, "renamed");
        assert!(manager.peer(PeerId(3)).is_none());
        assert_eq!(router.routes(), vec![Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn test_probe_result_sends_catchup_once() {
        let relays = StaticRelays::new(ServerId(1), &[ServerId(1)]);
        let (manager, _) = manager(relays.clone());
        manager
            .update(vec![network(9, &[1, 2])], vec![peer(2, 1, 1), peer(3, 1, 1)])
            .unwrap();

        manager.probe_result(ProbeResponse {
            online: vec![PeerId(2)],
            offline: vec![PeerId(3), PeerId(77)],
        });
        manager.probe_result(ProbeResponse {
            online: vec![PeerId(2)],
            offline: vec![],
        });

        let catchups: Vec<SyncPeer> = relays
            .sent()
            .into_iter()
            .filter_map(|(_, msg)| match msg {
                Message::SyncPeer(sync) => Some(sync),
                _ => None,
            })
            .collect();
        assert_eq!(catchups.len(), 1);
        let sync = &catchups[0];
        assert_eq!(sync.purpose, SyncPurpose::Catchup);
        assert_eq!(sync.dst_peer_id, PeerId(2));
        let info = sync.peer.as_ref().unwrap();
        assert_eq!(info.peer_id, PeerId(1));
        assert_eq!(info.ipv4, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(info.public_key, manager.local().public_key.to_bytes().to_vec());
        assert_eq!(info.primary_server.as_ref().unwrap().id, ServerId(1));
        assert_eq!(info.networks, refs(&[9]));

        assert!(manager.peer(PeerId(2)).unwrap().is_online());
        assert!(!manager.peer(PeerId(3)).unwrap().is_online());
    }

    #[test]
    fn test_catchup_exchange_builds_matching_tunnels() {
        let relays_a = StaticRelays::new(ServerId(1), &[ServerId(1)]);
        let relays_b = StaticRelays::new(ServerId(1), &[ServerId(1)]);
        let router_b = Arc::new(MemoryRouter::new());
        let a = MeshManager::new(local(1), relays_a.clone(), Arc::new(MemoryRouter::new()), Arc::new(Discard), TunnelOptions::default());
        let b = MeshManager::new(local(2), relays_b.clone(), router_b.clone(), Arc::new(Discard), TunnelOptions::default());

        a.update(vec![network(5, &[1, 2])], vec![peer(1, 1, 1), peer(2, 1, 1)]).unwrap();
        a.probe_result(ProbeResponse {
            online: vec![PeerId(2)],
            offline: vec![],
        });
        let catchup = relays_a
            .sent()
            .into_iter()
            .find_map(|(_, msg)| match msg {
                Message::SyncPeer(sync) if sync.purpose == SyncPurpose::Catchup => Some(sync),
                _ => None,
            })
            .unwrap();

        // B has never seen A: it learns it from the catchup.
        b.peer_catchup(catchup).unwrap();
        let learned = b.peer(PeerId(1)).unwrap();
        assert!(learned.is_caught_up());
        assert!(learned.is_online());
        assert_eq!(router_b.routes(), vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(members(&b, 5), vec![1]);
        assert!(b.tunnel(Ipv4Addr::new(10, 0, 0, 1)).is_some());

        let ack = relays_b
            .sent()
            .into_iter()
            .find_map(|(_, msg)| match msg {
                Message::SyncPeer(sync) if sync.purpose == SyncPurpose::CatchupAck => Some(sync),
                _ => None,
            })
            .unwrap();
        assert_eq!(ack.dst_peer_id, PeerId(1));
        a.peer_catchup_ack(ack).unwrap();
        assert!(a.peer(PeerId(2)).unwrap().is_caught_up());

        // Both sides derived the same key.
        let ta = a.tunnel(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        let tb = b.tunnel(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let sealed = ta.cipher().seal(9, b"ping").unwrap();
        assert_eq!(tb.cipher().open(9, &sealed).unwrap(), b"ping");
    }

    #[test]
    fn test_catchup_ack_from_unknown_peer() {
        let (manager, _) = manager(StaticRelays::new(ServerId(1), &[ServerId(1)]));
        let ack = SyncPeer {
            src_peer_id: PeerId(8),
            dst_peer_id: PeerId(1),
            purpose: SyncPurpose::CatchupAck,
            peer: Some(PeerInfo {
                public_key: vec![9; 32],
                ..PeerInfo::from_id(PeerId(8))
            }),
            endpoints: vec![],
        };
        assert!(matches!(manager.peer_catchup_ack(ack), Err(MeshError::PeerNotFound(PeerId(8)))));
    }

    #[test]
    fn test_catchup_claiming_another_peer_is_refused() {
        let relays = StaticRelays::new(ServerId(1), &[ServerId(1)]);
        let (manager, router) = manager(relays.clone());
        manager.update(vec![], vec![peer(1, 1, 1), peer(7, 1, 1)]).unwrap();

        let attacker = PrivateKey::generate(&mut OsRng);
        let forged = SyncPeer {
            src_peer_id: PeerId(66),
            dst_peer_id: PeerId(1),
            purpose: SyncPurpose::Catchup,
            peer: Some(PeerInfo {
                ipv4: Some(Ipv4Addr::new(10, 0, 0, 7)),
                public_key: attacker.public_key().to_bytes().to_vec(),
                ..PeerInfo::from_id(PeerId(7))
            }),
            endpoints: vec![],
        };

        assert!(matches!(
            manager.peer_catchup(forged.clone()),
            Err(MeshError::SenderMismatch {
                sender: PeerId(66),
                claimed: PeerId(7)
            })
        ));
        assert!(manager.peer(PeerId(7)).unwrap().tunnel().is_none());
        assert_eq!(router.routes(), vec![Ipv4Addr::new(10, 0, 0, 7)]);

        let forged_ack = SyncPeer {
            purpose: SyncPurpose::CatchupAck,
            ..forged.clone()
        };
        assert!(manager.peer_catchup_ack(forged_ack).is_err());
        let forged_endpoints = SyncPeer {
            purpose: SyncPurpose::EndpointsChanged,
            endpoints: vec!["192.0.2.66:4000".into()],
            ..forged
        };
        assert!(manager.peer_endpoints(forged_endpoints).is_err());

        assert!(!relays.sent().into_iter().any(|(_, msg)| matches!(
            msg,
            Message::SyncPeer(sync) if sync.purpose == SyncPurpose::CatchupAck
        )));
    }

    #[test]
    fn test_summary_is_cached_until_change() {
        let (manager, _) = manager(StaticRelays::new(ServerId(1), &[]));
        manager
            .update(vec![network(3, &[2, 5])], vec![peer(1, 1, 1), peer(2, 1, 1), peer(5, 2, 1)])
            .unwrap();

        let first = manager.summarize();
        assert_eq!(first.my_devices.len(), 2);
        assert!(first.my_devices.iter().all(|d| d.status == State::Relay));
        assert_eq!(first.networks.len(), 1);
        assert_eq!(first.networks[0].devices.len(), 2);
        assert!(Arc::ptr_eq(&first, &manager.summarize()));

        manager.update(vec![], vec![peer(1, 1, 1)]).unwrap();
        let second = manager.summarize();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.my_devices.len(), 1);
        assert!(second.networks.is_empty());
    }
}
