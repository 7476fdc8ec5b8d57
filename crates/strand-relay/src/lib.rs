//! # Strand Relay
//!
//! Relay transport for the Strand mesh.
//!
//! This crate provides:
//! - [`transport::Link`]: an encrypted, framed, bidirectional link over any
//!   async byte stream (TCP in production, in-memory duplex in tests)
//! - [`server::Server`]: accepts nodes, verifies their credential and keeps
//!   one [`session::Session`] per peer
//! - [`hooks`]: forwarding and probe behaviour for a relay server
//! - [`client::Client`]: a node's connection to one relay server
//! - [`manager::Manager`]: keeps a node connected to its set of servers
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Client (node)                          Session (relay server)
//!   ─────────────                          ──────────────────────
//!   Init
//!    │  Handshake { pubkey, noise(credential) }
//!   Connecting ──────────────────────────────▶ Init
//!                                              │ verify credential
//!            HandshakeAck { noise("30s") }     │ register by peer id
//!   Connected ◀─────────────────────────────── Running
//!    │
//!    │  Heartbeat / Forward / SyncPeer / Probe (encrypted)
//!    ▼
//! ```
//!
//! Only `Handshake` and `HandshakeAck` travel in plaintext. Every later
//! message is sealed with the Noise transport cipher under the frame nonce.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod duration;
pub mod error;
pub mod events;
pub mod handler;
pub mod hooks;
pub mod manager;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, ClientIdentity, ClientState};
pub use error::RelayError;
pub use events::{ManagerEvent, ServerEvent};
pub use handler::Handler;
pub use manager::{Manager, ManagerConfig, RelayHandler};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionState};
pub use transport::{Link, LinkOptions};

use strand_core::Message;

/// Anything that can queue a relay message for delivery.
///
/// Implemented by [`Client`] (towards a relay server) and [`Session`]
/// (towards a node).
pub trait PacketSender: Send + Sync {
    /// Queue `msg` without blocking.
    fn send(&self, msg: Message) -> Result<(), RelayError>;
}
