//! Identity of this node.

use std::net::Ipv4Addr;
use strand_core::{PeerId, UserId};
use strand_crypto::x25519::{PrivateKey, PublicKey};

/// The node's own peer record and static key pair
#[derive(Debug, Clone)]
pub struct LocalPeer {
    /// Device name
    pub name: String,
    /// Owner
    pub user_id: UserId,
    /// Peer id assigned by the control plane
    pub peer_id: PeerId,
    /// Virtual address
    pub ipv4: Ipv4Addr,
    /// Static X25519 private key
    pub private_key: PrivateKey,
    /// Matching public key
    pub public_key: PublicKey,
}

impl LocalPeer {
    /// Build a local peer, deriving the public key from `private_key`.
    #[must_use]
    pub fn new(name: impl Into<String>, user_id: UserId, peer_id: PeerId, ipv4: Ipv4Addr, private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            name: name.into(),
            user_id,
            peer_id,
            ipv4,
            private_key,
            public_key,
        }
    }
}
