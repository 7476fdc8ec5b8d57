//! Relay behaviour installed on a [`Server`].
//!
//! The server itself only authenticates and tracks sessions. These callbacks
//! turn it into a relay: peer traffic is routed to the destination session
//! and probe requests are answered from the session registry.

use crate::server::Server;
use crate::session::Session;
use crate::RelayError;
use std::sync::{Arc, Weak};
use strand_core::message::{ProbeRequest, ProbeResponse};
use strand_core::{Message, MessageKind, PeerId};

/// Register `Forward`, `SyncPeer` and `ProbeRequest` handling on `server`.
pub fn register_forwarding(server: &Arc<Server>) {
    let weak = Arc::downgrade(server);
    server.handler().on(MessageKind::Forward, move |session: &Arc<Session>, msg| {
        let Message::Forward(mut forward) = msg else {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        };
        // The relay knows who the sender is; never trust the claimed source.
        forward.src_peer_id = session.peer_id();
        let dst = forward.dst_peer_id;
        route(&weak, dst, Message::Forward(forward))
    });

    let weak = Arc::downgrade(server);
    server.handler().on(MessageKind::SyncPeer, move |session: &Arc<Session>, msg| {
        let Message::SyncPeer(mut sync) = msg else {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        };
        sync.src_peer_id = session.peer_id();
        let dst = sync.dst_peer_id;
        route(&weak, dst, Message::SyncPeer(sync))
    });

    let weak = Arc::downgrade(server);
    server.handler().on(MessageKind::ProbeRequest, move |session: &Arc<Session>, msg| {
        let Message::ProbeRequest(request) = msg else {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        };
        let server = weak.upgrade().ok_or(RelayError::Closed)?;
        session.send(probe(&server, &request).into())
    });
}

fn route(server: &Weak<Server>, dst: PeerId, msg: Message) -> Result<(), RelayError> {
    let server = server.upgrade().ok_or(RelayError::Closed)?;
    let Some(target) = server.session(dst) else {
        tracing::debug!("{:?} for offline peer {} dropped", msg.kind(), dst);
        return Ok(());
    };
    target.send(msg)
}

/// Split the requested peers into those with a live session and the rest.
#[must_use]
pub fn probe(server: &Server, request: &ProbeRequest) -> ProbeResponse {
    let mut response = ProbeResponse::default();
    for &peer_id in &request.peers {
        let online = server
            .session(peer_id)
            .is_some_and(|session| !session.is_closed());
        if online {
            response.online.push(peer_id);
        } else {
            response.offline.push(peer_id);
        }
    }
    response
}
