//! # Strand Mesh
//!
//! Mesh coordination for Strand nodes.
//!
//! - [`MeshManager`] keeps the peer table, probes peers through their relay
//!   server and runs the catchup exchange that derives a tunnel key per peer.
//! - [`Tunnel`] carries IP packets to one peer, directly over UDP once
//!   discovery found a path, through a relay until then.
//! - [`Driver`] ties the mesh to a control plane and a virtual device.
//!
//! ## Data path
//!
//! ```text
//!  device ──► Driver ──► MeshManager::tunnel(dst) ──► Tunnel::write
//!                                                    │          │
//!                                         UDP Endpoint     relay Forward
//!                                                    │          │
//!  device ◄── Driver ◄── FragmentSink ◄──────────────┘   RelayHandler
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod endpoint;
pub mod error;
pub mod local;
pub mod manager;
pub mod peer;
pub mod relay;
pub mod router;
pub mod summary;
pub mod tunnel;

pub use driver::{ControlPlane, Device, Driver, DriverConfig, DriverSummary, Profile};
pub use endpoint::{Endpoint, UdpPacketHandler};
pub use error::MeshError;
pub use local::LocalPeer;
pub use manager::MeshManager;
pub use peer::{CATCHUP_INTERVAL, PROBE_INTERVAL, Peer};
pub use relay::RelayProvider;
pub use router::{MemoryRouter, Router, RouterConfig};
pub use summary::{DeviceSummary, NetworkSummary, State, Summary};
pub use tunnel::{Delivery, FragmentSink, Tunnel, TunnelOptions};
