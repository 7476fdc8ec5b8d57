//! Error types for the mesh layer and the node driver.

use std::net::Ipv4Addr;
use strand_core::PeerId;
use strand_crypto::CryptoError;
use strand_relay::RelayError;
use thiserror::Error;

/// Mesh errors
#[derive(Debug, Error)]
pub enum MeshError {
    /// Relay transport failure
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Key exchange or tunnel cipher failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded
    #[error("message error: {0}")]
    Message(#[from] strand_core::Error),

    /// No peer with this id is known
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    /// The peer has not completed catchup yet
    #[error("no tunnel to peer {0}")]
    NoTunnel(PeerId),

    /// A relayed message addressed to another peer reached this node
    #[error("message for peer {0} delivered to the wrong node")]
    Misrouted(PeerId),

    /// A relayed sync describes a different peer than the one that sent it
    #[error("sync from peer {sender} claims to be peer {claimed}")]
    SenderMismatch {
        /// Peer id attested by the relay server
        sender: PeerId,
        /// Peer id in the sender description
        claimed: PeerId,
    },

    /// No relay server is connected that could reach the peer
    #[error("no relay server available for peer {0}")]
    NoRelay(PeerId),

    /// A peer advertised no or an invalid virtual address
    #[error("invalid address for peer {0}")]
    InvalidAddress(PeerId),

    /// An endpoint write queue is full
    #[error("endpoint queue full")]
    QueueFull,

    /// Control-plane request failed
    #[error("control plane: {0}")]
    ControlPlane(String),

    /// Virtual device failure
    #[error("device: {0}")]
    Device(String),

    /// Credential could not be decoded or has expired
    #[error("credential: {0}")]
    Credential(String),

    /// Route installation failed
    #[error("route {0}/32: {1}")]
    Route(Ipv4Addr, String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl MeshError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Relay(e) => e.is_transient(),
            Self::Io(_) | Self::NoRelay(_) | Self::QueueFull | Self::ControlPlane(_) => true,
            _ => false,
        }
    }
}
