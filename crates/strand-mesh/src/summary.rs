//! Serializable view of the mesh for status displays.

use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use strand_core::NetworkId;

/// How traffic to a device currently flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Through a relay server
    Relay,
    /// Directly over UDP
    P2P,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::P2P => f.write_str("p2p"),
        }
    }
}

/// One device of the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    /// Device name
    pub name: String,
    /// Virtual address
    pub ipv4: Ipv4Addr,
    /// Path state
    pub status: State,
}

/// A network and its known devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSummary {
    /// Network id
    pub id: NetworkId,
    /// Display name
    pub name: String,
    /// Members known to this node
    pub devices: Vec<DeviceSummary>,
}

/// Snapshot produced by [`crate::MeshManager::summarize`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Change counter the snapshot was taken at
    #[serde(skip)]
    pub generation: u64,
    /// Devices owned by the local user
    pub my_devices: Vec<DeviceSummary>,
    /// Networks the local node belongs to
    pub networks: Vec<NetworkSummary>,
}
