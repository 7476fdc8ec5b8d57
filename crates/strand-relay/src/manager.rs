//! Node side relay connection manager.
//!
//! The manager keeps one [`Client`] per desired relay server. Servers whose
//! connection failed or dropped are parked in `pending` and retried on every
//! [`Manager::tick`]. Business messages from any server are handed to a
//! single [`RelayHandler`].

use crate::client::{Client, ClientConfig, ClientIdentity};
use crate::events::ManagerEvent;
use crate::RelayError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use strand_core::message::{Forward, ProbeResponse, SyncPeer};
use strand_core::protocol::RelayServer;
use strand_core::{Message, MessageKind, ServerId};
use strand_crypto::x25519::PublicKey;
use tokio::sync::mpsc;

/// Receiver of business messages arriving on any relay client.
///
/// Callbacks run on the client's serve task; they must not block.
pub trait RelayHandler: Send + Sync {
    /// A peer relayed an encrypted packet to this node.
    fn on_forward(&self, server: ServerId, msg: Forward) -> Result<(), RelayError>;

    /// A peer sent a control message to this node.
    fn on_sync_peer(&self, server: ServerId, msg: SyncPeer) -> Result<(), RelayError>;

    /// Answer to a probe this node sent.
    fn on_probe_response(&self, server: ServerId, msg: ProbeResponse) -> Result<(), RelayError>;
}

/// Relay manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Deadline for dial plus handshake
    pub connect_timeout: Duration,
    /// Depth of the event channel
    pub event_capacity: usize,
    /// Settings for every client
    pub client: ClientConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            event_capacity: 256,
            client: ClientConfig::default(),
        }
    }
}

/// Relay manager
pub struct Manager {
    me: Weak<Manager>,
    config: ManagerConfig,
    local_key: PublicKey,
    credential: RwLock<Vec<u8>>,
    handler: Arc<dyn RelayHandler>,
    clients: DashMap<ServerId, Arc<Client>>,
    pending: DashMap<ServerId, RelayServer>,
    primary: AtomicU64,
    closed: AtomicBool,
    events_tx: mpsc::Sender<ManagerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ManagerEvent>>>,
}

impl Manager {
    /// Create a manager presenting `credential` to every server.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        local_key: PublicKey,
        credential: Vec<u8>,
        primary: ServerId,
        handler: Arc<dyn RelayHandler>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            local_key,
            credential: RwLock::new(credential),
            handler,
            clients: DashMap::new(),
            pending: DashMap::new(),
            primary: AtomicU64::new(primary.0),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Connect to `server` unless a client is already registered.
    ///
    /// Returns `true` if the server was already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the server key is invalid, the connection or
    /// handshake fails, or the manager is stopped.
    pub async fn connect(&self, server: RelayServer) -> Result<bool, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        if self.clients.contains_key(&server.id) {
            return Ok(true);
        }

        let id = server.id;
        let identity = ClientIdentity {
            public_key: self.local_key,
            credential: self.credential(),
        };
        let client = Client::new(server, identity, id == self.primary(), self.config.client.clone())?;
        self.register_callbacks(&client);

        let manager = self.me.clone();
        client.set_on_closed(move |client| {
            if let Some(manager) = manager.upgrade() {
                manager.on_client_closed(client);
            }
        });

        client.connect(self.config.connect_timeout).await?;

        if self.is_closed() {
            let _ = client.close();
            return Err(RelayError::Closed);
        }
        if let Some(old) = self.clients.insert(id, client.clone()) {
            if !Arc::ptr_eq(&old, &client) {
                let _ = old.close();
            }
        }
        // Closed between handshake and registration: the hook saw nothing
        // to remove, so park the server here.
        if client.is_closed() {
            self.on_client_closed(&client);
            return Err(RelayError::Closed);
        }

        tracing::info!("Relay server {} registered (primary: {})", id, client.is_primary());
        self.emit(ManagerEvent::ClientConnected(id));
        Ok(false)
    }

    fn register_callbacks(&self, client: &Arc<Client>) {
        let id = client.server_id();

        let handler = self.handler.clone();
        client.handler().on(MessageKind::Forward, move |_, msg| match msg {
            Message::Forward(forward) => handler.on_forward(id, forward),
            other => Err(RelayError::UnexpectedMessage(other.kind())),
        });
        let handler = self.handler.clone();
        client.handler().on(MessageKind::SyncPeer, move |_, msg| match msg {
            Message::SyncPeer(sync) => handler.on_sync_peer(id, sync),
            other => Err(RelayError::UnexpectedMessage(other.kind())),
        });
        let handler = self.handler.clone();
        client.handler().on(MessageKind::ProbeResponse, move |_, msg| match msg {
            Message::ProbeResponse(resp) => handler.on_probe_response(id, resp),
            other => Err(RelayError::UnexpectedMessage(other.kind())),
        });
    }

    fn on_client_closed(&self, client: &Arc<Client>) {
        if self.is_closed() {
            return;
        }
        let id = client.server_id();
        let removed = self
            .clients
            .remove_if(&id, |_, current| Arc::ptr_eq(current, client))
            .is_some();
        if !removed {
            return;
        }

        tracing::warn!("Relay server {} disconnected, will retry", id);
        self.pending.insert(id, client.server().clone());
        self.emit(ManagerEvent::ClientClosed(id));
    }

    fn emit(&self, event: ManagerEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            tracing::warn!("Dropping relay manager event {:?}: {}", event, e);
        }
    }

    /// Retry every pending server.
    pub async fn tick(&self) {
        let pending: Vec<RelayServer> = self.pending.iter().map(|s| s.value().clone()).collect();
        for server in pending {
            let id = server.id;
            match self.connect(server).await {
                Ok(_) => {
                    self.pending.remove(&id);
                }
                Err(e) => tracing::debug!("Reconnect to relay server {} failed: {}", id, e),
            }
        }
    }

    /// Connect to `server`, parking it as pending on failure.
    pub async fn add_server(&self, server: RelayServer) {
        if self.clients.contains_key(&server.id) {
            return;
        }
        let id = server.id;
        if let Err(e) = self.connect(server.clone()).await {
            tracing::warn!("Connect to relay server {} ({}) failed: {}", id, server.address(), e);
            if !self.is_closed() {
                self.pending.insert(id, server);
            }
        } else {
            self.pending.remove(&id);
        }
    }

    /// Make `servers` the desired set.
    ///
    /// Clients for servers no longer desired are unregistered before they
    /// are closed, so their close hook does not queue a reconnect.
    pub async fn update(&self, servers: &[RelayServer]) {
        let desired: HashSet<ServerId> = servers.iter().map(|s| s.id).collect();

        let stale: Vec<ServerId> = self
            .clients
            .iter()
            .map(|c| *c.key())
            .filter(|id| !desired.contains(id))
            .collect();
        for id in stale {
            self.pending.remove(&id);
            if let Some((_, client)) = self.clients.remove(&id) {
                tracing::info!("Relay server {} no longer desired", id);
                let _ = client.close();
            }
        }
        self.pending.retain(|id, _| desired.contains(id));

        for server in servers {
            self.add_server(server.clone()).await;
        }
    }

    /// Close every client. Idempotent.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|c| c.value().clone()).collect();
        self.clients.clear();
        self.pending.clear();
        for client in clients {
            let _ = client.close();
        }
        tracing::info!("Relay manager stopped");
    }

    /// Whether [`Manager::stop`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Primary relay server id.
    #[must_use]
    pub fn primary(&self) -> ServerId {
        ServerId(self.primary.load(Ordering::SeqCst))
    }

    /// Change the primary relay server. Applies to clients created later.
    pub fn set_primary(&self, id: ServerId) {
        self.primary.store(id.0, Ordering::SeqCst);
    }

    /// Client for the primary server, if connected.
    #[must_use]
    pub fn primary_client(&self) -> Option<Arc<Client>> {
        self.client(self.primary())
    }

    /// Client for `id`, if connected.
    #[must_use]
    pub fn client(&self, id: ServerId) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|c| c.value().clone())
    }

    /// Descriptor of `id`, whether connected or waiting for reconnect.
    #[must_use]
    pub fn server(&self, id: ServerId) -> Option<RelayServer> {
        if let Some(client) = self.clients.get(&id) {
            return Some(client.server().clone());
        }
        self.pending.get(&id).map(|s| s.value().clone())
    }

    /// Ids of the connected servers.
    #[must_use]
    pub fn connected(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.clients.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of the servers waiting for reconnect.
    #[must_use]
    pub fn pending(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.pending.iter().map(|s| *s.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Credential presented on new connections.
    #[must_use]
    pub fn credential(&self) -> Vec<u8> {
        self.credential.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Replace the credential. Live clients keep their session; new
    /// connections present the new credential.
    pub fn set_credential(&self, credential: Vec<u8>) {
        if let Ok(mut current) = self.credential.write() {
            *current = credential;
        }
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ManagerEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("clients", &self.clients.len())
            .field("pending", &self.pending.len())
            .field("primary", &self.primary())
            .finish()
    }
}
