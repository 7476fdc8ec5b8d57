//! Access to relay servers from the mesh layer.

use std::sync::Arc;
use strand_core::ServerId;
use strand_core::protocol::RelayServer;
use strand_relay::{Manager, PacketSender};

/// Source of relay senders for tunnels and the mesh manager.
pub trait RelayProvider: Send + Sync {
    /// The node's primary relay server.
    fn primary_server(&self) -> ServerId;

    /// Sender for a connected relay server.
    fn sender(&self, server: ServerId) -> Option<Arc<dyn PacketSender>>;

    /// Descriptor of the primary relay server, advertised during catchup.
    fn primary_descriptor(&self) -> Option<RelayServer>;

    /// Sender for the primary relay server.
    fn primary_sender(&self) -> Option<Arc<dyn PacketSender>> {
        self.sender(self.primary_server())
    }
}

/// Sender for `server`, falling back to the primary server.
pub fn route(provider: &dyn RelayProvider, server: ServerId) -> Option<Arc<dyn PacketSender>> {
    provider.sender(server).or_else(|| provider.primary_sender())
}

impl RelayProvider for Manager {
    fn primary_server(&self) -> ServerId {
        self.primary()
    }

    fn sender(&self, server: ServerId) -> Option<Arc<dyn PacketSender>> {
        self.client(server).map(|c| c as Arc<dyn PacketSender>)
    }

    fn primary_descriptor(&self) -> Option<RelayServer> {
        self.server(self.primary())
    }
}
