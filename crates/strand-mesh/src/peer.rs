//! Remote peer bookkeeping.
//!
//! A [`Peer`] records when it was last probed and whether the catchup
//! exchange completed. Unacknowledged catchups back off quadratically:
//! after `n` attempts without an ack the next one waits
//! `(n + 1)² × CATCHUP_INTERVAL`.

use crate::tunnel::Tunnel;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use strand_core::protocol;
use strand_core::{PeerId, ServerId, UserId};

/// Minimum time between two probes of the same peer.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(600);

/// Base interval between catchup attempts.
pub const CATCHUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct ProbeInfo {
    last_request_at: Option<Instant>,
    last_response_at: Option<Instant>,
    online: bool,
}

#[derive(Debug, Default)]
struct CatchupInfo {
    last_send_at: Option<Instant>,
    caught_up_at: Option<Instant>,
    caught_up: bool,
    no_ack: u32,
}

#[derive(Debug, Default)]
struct PeerState {
    probe: ProbeInfo,
    catchup: CatchupInfo,
}

/// A remote node of the mesh
#[derive(Debug)]
pub struct Peer {
    info: RwLock<protocol::Peer>,
    state: RwLock<PeerState>,
    tunnel: RwLock<Option<Arc<Tunnel>>>,
}

impl Peer {
    /// Create a peer with no tunnel.
    #[must_use]
    pub fn new(info: protocol::Peer) -> Self {
        Self {
            info: RwLock::new(info),
            state: RwLock::new(PeerState::default()),
            tunnel: RwLock::new(None),
        }
    }

    /// Snapshot of the control-plane record.
    #[must_use]
    pub fn info(&self) -> protocol::Peer {
        match self.info.read() {
            Ok(info) => info.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_info(&self, info: protocol::Peer) {
        if let Ok(mut current) = self.info.write() {
            *current = info;
        }
    }

    /// Peer id.
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.info().id
    }

    /// Owner.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.info().user_id
    }

    /// Virtual address.
    #[must_use]
    pub fn ipv4(&self) -> Ipv4Addr {
        self.info().ipv4
    }

    /// The peer's primary relay server.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.info().server_id
    }

    /// Record a probe answer.
    pub fn set_probe_status(&self, online: bool) {
        if let Ok(mut state) = self.state.write() {
            state.probe.online = online;
            state.probe.last_response_at = Some(Instant::now());
        }
    }

    /// Whether the last probe reported the peer online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.read().map(|s| s.probe.online).unwrap_or(false)
    }

    /// Record that a probe including this peer was sent.
    pub fn set_last_probe_request_at(&self, at: Instant) {
        if let Ok(mut state) = self.state.write() {
            state.probe.last_request_at = Some(at);
        }
    }

    /// Whether the peer is due for a probe.
    #[must_use]
    pub fn is_need_probe(&self) -> bool {
        self.is_need_probe_at(Instant::now())
    }

    /// [`Peer::is_need_probe`] evaluated at `now`.
    #[must_use]
    pub fn is_need_probe_at(&self, now: Instant) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        match state.probe.last_request_at {
            Some(at) => now.saturating_duration_since(at) > PROBE_INTERVAL,
            None => true,
        }
    }

    /// Whether the catchup exchange completed.
    #[must_use]
    pub fn is_caught_up(&self) -> bool {
        self.state.read().map(|s| s.catchup.caught_up).unwrap_or(false)
    }

    /// Whether a catchup should be sent now.
    #[must_use]
    pub fn is_need_catchup(&self) -> bool {
        self.is_need_catchup_at(Instant::now())
    }

    /// [`Peer::is_need_catchup`] evaluated at `now`.
    #[must_use]
    pub fn is_need_catchup_at(&self, now: Instant) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        if state.catchup.caught_up {
            return false;
        }
        match state.catchup.last_send_at {
            Some(at) => now.saturating_duration_since(at) > catchup_backoff(state.catchup.no_ack),
            None => true,
        }
    }

    /// Record an unacknowledged catchup attempt.
    pub fn set_last_send_catchup_at(&self, at: Instant) {
        if let Ok(mut state) = self.state.write() {
            state.catchup.no_ack = state.catchup.no_ack.saturating_add(1);
            state.catchup.last_send_at = Some(at);
        }
    }

    /// Record a completed catchup.
    pub fn set_catchup_at(&self, at: Instant) {
        if let Ok(mut state) = self.state.write() {
            state.catchup.caught_up = true;
            state.catchup.no_ack = 0;
            state.catchup.caught_up_at = Some(at);
        }
    }

    /// Install `tunnel`, closing the previous one.
    pub fn set_tunnel(&self, tunnel: Arc<Tunnel>) {
        let previous = self
            .tunnel
            .write()
            .ok()
            .and_then(|mut current| current.replace(tunnel));
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// The installed tunnel.
    #[must_use]
    pub fn tunnel(&self) -> Option<Arc<Tunnel>> {
        self.tunnel.read().ok().and_then(|t| t.clone())
    }

    /// Tear down the tunnel, if any.
    pub fn close(&self) {
        let tunnel = self.tunnel.write().ok().and_then(|mut t| t.take());
        if let Some(tunnel) = tunnel {
            tunnel.close();
        }
    }
}

/// Wait before the next catchup after `no_ack` unanswered attempts.
#[must_use]
pub fn catchup_backoff(no_ack: u32) -> Duration {
    let factor = no_ack.saturating_add(1);
    CATCHUP_INTERVAL.saturating_mul(factor.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(protocol::Peer {
            id: PeerId(2),
            user_id: UserId(1),
            name: "laptop".into(),
            ipv4: Ipv4Addr::new(10, 0, 0, 2),
            server_id: ServerId(1),
            active: true,
        })
    }

    #[test]
    fn test_backoff_is_quadratic() {
        assert_eq!(catchup_backoff(0), Duration::from_secs(30));
        assert_eq!(catchup_backoff(1), Duration::from_secs(120));
        assert_eq!(catchup_backoff(2), Duration::from_secs(270));
        assert_eq!(catchup_backoff(3), Duration::from_secs(480));
    }

    #[test]
    fn test_catchup_backoff_grows() {
        let peer = peer();
        let start = Instant::now();
        assert!(peer.is_need_catchup_at(start));

        peer.set_last_send_catchup_at(start);
        assert!(!peer.is_need_catchup_at(start));
        assert!(!peer.is_need_catchup_at(start + Duration::from_secs(119)));
        assert!(peer.is_need_catchup_at(start + Duration::from_secs(121)));

        let second = start + Duration::from_secs(121);
        peer.set_last_send_catchup_at(second);
        assert!(!peer.is_need_catchup_at(second + Duration::from_secs(269)));
        assert!(peer.is_need_catchup_at(second + Duration::from_secs(271)));
    }

    #[test]
    fn test_catchup_done_stops_retries() {
        let peer = peer();
        let now = Instant::now();
        peer.set_last_send_catchup_at(now);
        peer.set_catchup_at(now);
        assert!(peer.is_caught_up());
        assert!(!peer.is_need_catchup_at(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_probe_interval() {
        let peer = peer();
        let now = Instant::now();
        assert!(peer.is_need_probe_at(now));
        peer.set_last_probe_request_at(now);
        assert!(!peer.is_need_probe_at(now + Duration::from_secs(599)));
        assert!(peer.is_need_probe_at(now + Duration::from_secs(601)));

        peer.set_probe_status(true);
        assert!(peer.is_online());
    }
}
