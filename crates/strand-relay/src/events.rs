//! Notifications published by relay servers and the relay manager.
//!
//! Both channels are bounded and published with `try_send`; a full channel
//! drops the event with a warning instead of blocking the publisher.

use strand_core::{PeerId, ServerId};

/// Server side notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The registered session for a peer went away
    SessionClosed {
        /// Peer that went offline
        peer_id: PeerId,
    },
}

/// Node side notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A client completed its handshake and was registered
    ClientConnected(ServerId),
    /// A registered client closed; the server is pending reconnect
    ClientClosed(ServerId),
}

impl ManagerEvent {
    /// Server the event refers to.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        match self {
            Self::ClientConnected(id) | Self::ClientClosed(id) => *id,
        }
    }
}
