//! Relay message kinds and payloads.
//!
//! Every relay frame and UDP fragment carries a [`MessageKind`] code. Relay
//! frame payloads are one of the [`Message`] variants serialized with
//! bincode; fragment payloads of kind [`MessageKind::Fragment`] are raw
//! encrypted IP packets.

use crate::error::{CodecError, Error};
use crate::ids::{NetworkId, PeerId};
use crate::protocol::RelayServer;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Message kind codes carried in frame headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageKind {
    /// Client hello carrying the first Noise message
    Handshake = 1,
    /// Server reply carrying the second Noise message
    HandshakeAck = 2,
    /// Client keepalive, echoed by the server
    Heartbeat = 3,
    /// Ask the relay which peers are online
    ProbeRequest = 4,
    /// Online / offline partition of probed peers
    ProbeResponse = 5,
    /// Peer-to-peer control message routed by the relay
    SyncPeer = 6,
    /// Encrypted IP packet routed by the relay
    Forward = 7,
    /// UDP path discovery between peers
    Discovery = 8,
    /// Encrypted IP packet sent directly over UDP
    Fragment = 9,
    /// Diagnostic echo request
    EchoRequest = 100,
    /// Diagnostic echo response
    EchoResponse = 101,
}

impl MessageKind {
    /// Handshake kinds are the only ones sent without transport encryption.
    #[must_use]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake | Self::HandshakeAck)
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::HandshakeAck),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::ProbeRequest),
            5 => Ok(Self::ProbeResponse),
            6 => Ok(Self::SyncPeer),
            7 => Ok(Self::Forward),
            8 => Ok(Self::Discovery),
            9 => Ok(Self::Fragment),
            100 => Ok(Self::EchoRequest),
            101 => Ok(Self::EchoResponse),
            _ => Err(CodecError::UnknownKind(value)),
        }
    }
}

impl From<MessageKind> for u16 {
    fn from(kind: MessageKind) -> u16 {
        kind as u16
    }
}

/// Client hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Node's static X25519 public key
    pub public_key: Vec<u8>,
    /// First Noise message; payload is the credential
    pub message: Vec<u8>,
    /// Whether this relay server is the node's primary
    pub is_primary: bool,
}

/// Server reply to [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    /// Second Noise message; payload is the heartbeat interval
    pub message: Vec<u8>,
}

/// Keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender clock, nanoseconds since the unix epoch
    pub timestamp: u64,
}

/// Online check for a set of peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// Peers to check
    pub peers: Vec<PeerId>,
}

/// Answer to [`ProbeRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    /// Peers with a live session on the relay
    pub online: Vec<PeerId>,
    /// Peers without a session
    pub offline: Vec<PeerId>,
}

/// What a [`SyncPeer`] message asks of its receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPurpose {
    /// Sender introduces itself; receiver derives the tunnel key
    Catchup,
    /// Receiver of a catchup answers with its key
    CatchupAck,
    /// Sender asks to start UDP discovery with its endpoints
    PairRequest,
    /// Answer to a pair request with the receiver's endpoints
    PairResponse,
    /// Sender's endpoints changed
    EndpointsChanged,
}

/// Network membership advertised during catchup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRef {
    /// Network identifier
    pub id: NetworkId,
    /// Display name
    pub name: String,
}

/// Description of the sending peer in a [`SyncPeer`] message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Owner
    pub user_id: crate::ids::UserId,
    /// Sender peer id
    pub peer_id: PeerId,
    /// Virtual address
    pub ipv4: Option<Ipv4Addr>,
    /// Device name
    pub name: String,
    /// Static X25519 public key
    pub public_key: Vec<u8>,
    /// Sender's primary relay server
    pub primary_server: Option<RelayServer>,
    /// Networks the sender belongs to
    pub networks: Vec<NetworkRef>,
}

impl PeerInfo {
    /// PeerInfo carrying only the sender id.
    #[must_use]
    pub fn from_id(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            ..Self::default()
        }
    }
}

/// Peer-to-peer control message routed through relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPeer {
    /// Sender, stamped by the relay server with the session's peer id
    pub src_peer_id: PeerId,
    /// Receiver
    pub dst_peer_id: PeerId,
    /// What the receiver should do
    pub purpose: SyncPurpose,
    /// Sender description
    pub peer: Option<PeerInfo>,
    /// UDP endpoints (`ip:port`)
    pub endpoints: Vec<String>,
}

/// Encrypted IP packet relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Sender
    pub src_peer_id: PeerId,
    /// Receiver
    pub dst_peer_id: PeerId,
    /// Tunnel cipher nonce
    pub nonce: u32,
    /// Ciphertext
    pub fragment: Vec<u8>,
}

/// UDP path discovery probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    /// Peer that originated the probe
    pub sender_peer_id: PeerId,
    /// Originator clock, microseconds since the unix epoch
    pub timestamp: u64,
}

/// Diagnostic echo body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    /// Sequence number chosen by the requester
    pub sequence: u32,
    /// Free-form body
    pub body: String,
}

/// A decoded relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// See [`Handshake`]
    Handshake(Handshake),
    /// See [`HandshakeAck`]
    HandshakeAck(HandshakeAck),
    /// See [`Heartbeat`]
    Heartbeat(Heartbeat),
    /// See [`ProbeRequest`]
    ProbeRequest(ProbeRequest),
    /// See [`ProbeResponse`]
    ProbeResponse(ProbeResponse),
    /// See [`SyncPeer`]
    SyncPeer(SyncPeer),
    /// See [`Forward`]
    Forward(Forward),
    /// See [`Discovery`]
    Discovery(Discovery),
    /// Echo request
    EchoRequest(Echo),
    /// Echo response
    EchoResponse(Echo),
}

macro_rules! message_from {
    ($($variant:ident($payload:ty)),* $(,)?) => {
        $(
            impl From<$payload> for Message {
                fn from(p: $payload) -> Self {
                    Message::$variant(p)
                }
            }
        )*
    };
}

message_from!(
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Heartbeat(Heartbeat),
    ProbeRequest(ProbeRequest),
    ProbeResponse(ProbeResponse),
    SyncPeer(SyncPeer),
    Forward(Forward),
    Discovery(Discovery),
);

impl Message {
    /// Kind code of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Handshake(_) => MessageKind::Handshake,
            Self::HandshakeAck(_) => MessageKind::HandshakeAck,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
            Self::ProbeRequest(_) => MessageKind::ProbeRequest,
            Self::ProbeResponse(_) => MessageKind::ProbeResponse,
            Self::SyncPeer(_) => MessageKind::SyncPeer,
            Self::Forward(_) => MessageKind::Forward,
            Self::Discovery(_) => MessageKind::Discovery,
            Self::EchoRequest(_) => MessageKind::EchoRequest,
            Self::EchoResponse(_) => MessageKind::EchoResponse,
        }
    }

    /// Serialize the payload (without frame header).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if bincode fails.
    pub fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        let bytes = match self {
            Self::Handshake(p) => bincode::serialize(p)?,
            Self::HandshakeAck(p) => bincode::serialize(p)?,
            Self::Heartbeat(p) => bincode::serialize(p)?,
            Self::ProbeRequest(p) => bincode::serialize(p)?,
            Self::ProbeResponse(p) => bincode::serialize(p)?,
            Self::SyncPeer(p) => bincode::serialize(p)?,
            Self::Forward(p) => bincode::serialize(p)?,
            Self::Discovery(p) => bincode::serialize(p)?,
            Self::EchoRequest(p) | Self::EchoResponse(p) => bincode::serialize(p)?,
        };
        Ok(bytes)
    }

    /// Deserialize a payload of the given kind.
    ///
    /// # Errors
    ///
    /// - [`Error::UnexpectedKind`] for [`MessageKind::Fragment`], which has no
    ///   structured payload
    /// - [`Error::Serialization`] if the bytes do not decode
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, Error> {
        let msg = match kind {
            MessageKind::Handshake => Self::Handshake(bincode::deserialize(payload)?),
            MessageKind::HandshakeAck => Self::HandshakeAck(bincode::deserialize(payload)?),
            MessageKind::Heartbeat => Self::Heartbeat(bincode::deserialize(payload)?),
            MessageKind::ProbeRequest => Self::ProbeRequest(bincode::deserialize(payload)?),
            MessageKind::ProbeResponse => Self::ProbeResponse(bincode::deserialize(payload)?),
            MessageKind::SyncPeer => Self::SyncPeer(bincode::deserialize(payload)?),
            MessageKind::Forward => Self::Forward(bincode::deserialize(payload)?),
            MessageKind::Discovery => Self::Discovery(bincode::deserialize(payload)?),
            MessageKind::EchoRequest => Self::EchoRequest(bincode::deserialize(payload)?),
            MessageKind::EchoResponse => Self::EchoResponse(bincode::deserialize(payload)?),
            MessageKind::Fragment => return Err(Error::UnexpectedKind(kind)),
        };
        Ok(msg)
    }
}
