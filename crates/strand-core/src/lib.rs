//! # Strand Core
//!
//! Wire-level building blocks shared by relay servers and mesh nodes.
//!
//! This crate provides:
//! - Identifier newtypes for peers, users, networks and relay servers
//! - Control-plane records (relay servers, peers, networks)
//! - Relay message kinds and their payloads
//! - The streaming relay frame codec and the UDP fragment codec
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Messages                                  │
//! │   (Handshake, Heartbeat, Probe, SyncPeer, Forward, Discovery)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Relay frames (TCP)                              │
//! │   nonce | kind ^ nonce | size | payload                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Fragments (UDP, peer to peer)                   │
//! │   nonce | kind ^ nonce | peer id ^ nonce | ciphertext           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod ids;
pub mod message;
pub mod protocol;

use std::time::Duration;

pub use codec::{Frame, FrameDecoder, FragmentHeader};
pub use error::{CodecError, Error};
pub use ids::{NetworkId, PeerId, ServerId, UserId};
pub use message::{Message, MessageKind};

/// Size of the frame nonce field
pub const HEADER_NONCE_SIZE: usize = 4;

/// Size of the frame kind field
pub const HEADER_KIND_SIZE: usize = 2;

/// Relay frame header: nonce, kind, payload size
pub const FRAME_HEADER_SIZE: usize = 10;

/// Fragment header: nonce, kind, peer id
pub const FRAGMENT_HEADER_SIZE: usize = 14;

/// Read buffer size for relay connections and UDP endpoints
pub const MAX_BUFFER_SIZE: usize = 4096;

/// Largest payload accepted in a relay frame
pub const MAX_MESSAGE_SIZE: usize = 2048 - 32;

/// Largest IP packet a tunnel will carry
pub const MAX_SEGMENT_SIZE: usize = MAX_MESSAGE_SIZE;

/// Default interval between client heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between UDP discovery rounds
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
