//! Control-plane records.
//!
//! These are the shapes a node receives from the control plane. They are
//! serde friendly (JSON on the control-plane API) and are consumed as-is by
//! the relay and mesh layers.

use crate::ids::{NetworkId, PeerId, ServerId, UserId};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Default STUN port when a relay server does not specify one.
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// A relay server as published by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    /// Server identifier
    pub id: ServerId,
    /// Unique node name across regions, e.g. "1b"
    pub name: String,
    /// Region the server runs in
    pub region: String,
    /// Host name or address
    #[serde(default)]
    pub host: String,
    /// Relay TCP port
    #[serde(default)]
    pub port: u16,
    /// STUN port; 0 means [`DEFAULT_STUN_PORT`], -1 disables STUN
    #[serde(default)]
    pub stun_port: i32,
    /// Base64 encoded X25519 static public key
    pub public_key: String,
}

impl RelayServer {
    /// `host:port` of the relay listener.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// STUN port, if STUN is enabled on this server.
    #[must_use]
    pub fn stun_port(&self) -> Option<u16> {
        match self.stun_port {
            0 => Some(DEFAULT_STUN_PORT),
            p if p > 0 => u16::try_from(p).ok(),
            _ => None,
        }
    }
}

/// A node in the peer graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer identifier
    pub id: PeerId,
    /// Owner
    pub user_id: UserId,
    /// Human readable device name
    pub name: String,
    /// Virtual address
    pub ipv4: Ipv4Addr,
    /// Primary relay server of the peer
    pub server_id: ServerId,
    /// Whether the peer is currently active
    #[serde(default)]
    pub active: bool,
}

/// A network: a named group of peers that may reach each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network identifier
    pub id: NetworkId,
    /// Display name
    pub name: String,
    /// Members
    #[serde(default)]
    pub peers: Vec<PeerId>,
}

/// Result of a peer graph pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerGraphResponse {
    /// Graph unchanged since `unique_hash` was issued
    #[serde(default)]
    pub not_modified: bool,
    /// Opaque version of the graph
    #[serde(default)]
    pub unique_hash: String,
    /// Seconds until the next pull; 0 keeps the current interval
    #[serde(default)]
    pub update_interval: u64,
    /// Relay servers the node should stay connected to
    #[serde(default)]
    pub relay_servers: Vec<RelayServer>,
    /// Peers visible to the node, including itself
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Networks the node belongs to
    #[serde(default)]
    pub networks: Vec<Network>,
}

/// Identity handed to a node when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightResponse {
    /// Node identifier
    pub id: PeerId,
    /// Owner
    pub user_id: UserId,
    /// Device name
    pub name: String,
    /// Virtual address
    pub ipv4: Ipv4Addr,
    /// Primary relay server
    pub primary_server: RelayServer,
    /// Base64 encoded credential
    pub credential: String,
    /// Credential lease in seconds
    pub credential_lease: u64,
}

/// Credential renewal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewCredentialRequest {
    /// Current base64 encoded credential
    pub credential: String,
}

/// Credential renewal response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewCredentialResponse {
    /// New base64 encoded credential
    pub credential: String,
    /// Lease of the new credential in seconds
    pub credential_lease: u64,
}
