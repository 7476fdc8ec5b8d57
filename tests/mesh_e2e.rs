//! End-to-end mesh scenarios: nodes driven by [`strand_mesh::Driver`]
//! exchanging IP packets through a real relay server on loopback.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use strand_core::PeerId;
use strand_integration_tests::fixtures::{
    TestNode, TestRelay, fast_config, ipv4_packet, peer_graph, start_node, start_node_with_lease, vaddr,
    WAIT_TIMEOUT, wait_until,
};
use strand_mesh::{DriverConfig, State};

const QUIET: Duration = Duration::from_millis(300);

async fn connected_pair(config: DriverConfig) -> (TestRelay, TestNode, TestNode) {
    let relay = TestRelay::start(1).await;
    let a = start_node(1, &relay, &[1, 2], config.clone()).await;
    let b = start_node(2, &relay, &[1, 2], config).await;

    wait_until("both sessions", || relay.has_session(1) && relay.has_session(2)).await;
    wait_until("tunnels both ways", || a.has_tunnel_to(2) && b.has_tunnel_to(1)).await;
    (relay, a, b)
}

#[tokio::test]
async fn test_preflight_brings_device_up_and_installs_routes() {
    let (_relay, a, b) = connected_pair(fast_config()).await;

    assert_eq!(a.device.address(), Some(vaddr(1)));
    assert_eq!(b.device.address(), Some(vaddr(2)));
    assert_eq!(a.device.routes(), vec![vaddr(2)]);
    assert_eq!(b.device.routes(), vec![vaddr(1)]);
    assert!(a.driver.is_authenticated());

    wait_until("primary connected", || a.driver.is_primary_connected()).await;
    let summary = a.driver.summarize();
    assert_eq!(summary.status, "connected");
    assert!(summary.enabled);
    let profile = summary.profile.expect("profile after preflight");
    assert_eq!(profile.ipv4, vaddr(1));
    assert_eq!(profile.name, "node-1");

    a.driver.terminate().await;
    b.driver.terminate().await;
}

#[tokio::test]
async fn test_packets_cross_the_relay_both_ways() {
    let (_relay, mut a, mut b) = connected_pair(fast_config()).await;

    let ping = ipv4_packet(vaddr(1), vaddr(2), b"ping");
    a.device.inject(ping.clone()).await;
    assert_eq!(b.device.next_packet().await, ping);

    let pong = ipv4_packet(vaddr(2), vaddr(1), b"pong");
    b.device.inject(pong.clone()).await;
    assert_eq!(a.device.next_packet().await, pong);

    // No endpoints advertised, so traffic stays relayed
    let summary = a.driver.summarize();
    let devices = &summary.mesh.networks[0].devices;
    let peer = devices.iter().find(|d| d.ipv4 == vaddr(2)).expect("peer in summary");
    assert_eq!(peer.status, State::Relay);

    a.driver.terminate().await;
    b.driver.terminate().await;
}

#[tokio::test]
async fn test_direct_path_found_through_discovery() {
    let config = DriverConfig {
        advertise_addresses: vec![Ipv4Addr::LOCALHOST],
        ..fast_config()
    };
    let (_relay, a, mut b) = connected_pair(config).await;

    let mesh_a = a.driver.mesh().expect("mesh");
    wait_until("endpoints advertised", || !mesh_a.local_endpoints().is_empty()).await;
    assert_eq!(mesh_a.local_endpoints().len(), 1);
    assert!(mesh_a.local_endpoints()[0].starts_with("127.0.0.1:"));

    let direct_path = || {
        mesh_a
            .peer(PeerId(2))
            .and_then(|p| p.tunnel())
            .is_some_and(|t| t.reachable_endpoint().is_some())
    };

    // Relayed writes trigger the endpoint exchange; keep some traffic going
    // until discovery settles.
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !direct_path() {
        assert!(tokio::time::Instant::now() < deadline, "no direct path found");
        a.device.inject(ipv4_packet(vaddr(1), vaddr(2), b"warmup")).await;
        while b.device.try_next_packet(Duration::from_millis(100)).await.is_some() {}
    }

    let summary = a.driver.summarize();
    let peer = summary.mesh.networks[0].devices.iter().find(|d| d.ipv4 == vaddr(2)).expect("peer in summary");
    assert_eq!(peer.status, State::P2P);

    let direct = ipv4_packet(vaddr(1), vaddr(2), b"direct");
    a.device.inject(direct.clone()).await;
    let received = loop {
        let packet = b.device.next_packet().await;
        if packet == direct {
            break packet;
        }
    };
    assert_eq!(received, direct);

    a.driver.terminate().await;
    b.driver.terminate().await;
}

#[tokio::test]
async fn test_own_address_loops_back_and_ssdp_is_dropped() {
    let relay = TestRelay::start(1).await;
    let mut a = start_node(1, &relay, &[1], fast_config()).await;

    let own = ipv4_packet(vaddr(1), vaddr(1), b"self");
    a.device.inject(own.clone()).await;
    assert_eq!(a.device.next_packet().await, own);

    let ssdp = ipv4_packet(vaddr(1), Ipv4Addr::new(239, 255, 255, 250), b"M-SEARCH");
    a.device.inject(ssdp).await;
    let unknown = ipv4_packet(vaddr(1), vaddr(9), b"nobody");
    a.device.inject(unknown).await;
    assert!(a.device.try_next_packet(QUIET).await.is_none());

    a.driver.terminate().await;
}

#[tokio::test]
async fn test_disabled_driver_drops_traffic() {
    let (_relay, a, mut b) = connected_pair(fast_config()).await;

    b.driver.disable();
    a.device.inject(ipv4_packet(vaddr(1), vaddr(2), b"dropped")).await;
    assert!(b.device.try_next_packet(QUIET).await.is_none());
    assert!(!b.driver.summarize().enabled);

    b.driver.enable();
    let delivered = ipv4_packet(vaddr(1), vaddr(2), b"delivered");
    a.device.inject(delivered.clone()).await;
    assert_eq!(b.device.next_packet().await, delivered);

    a.driver.terminate().await;
    b.driver.terminate().await;
}

#[tokio::test]
async fn test_peer_removed_from_graph_is_forgotten() {
    let config = DriverConfig {
        pull_interval: Duration::from_millis(100),
        ..fast_config()
    };
    let (relay, a, b) = connected_pair(config).await;

    a.control.set_graph(peer_graph(&relay.descriptor, &[1], "v2"));
    let mesh = a.driver.mesh().expect("mesh");
    wait_until("peer 2 removed", || mesh.peer(PeerId(2)).is_none()).await;
    assert!(a.device.routes().is_empty());

    // Unchanged graph is answered as not modified and keeps state
    let pulls = a.control.pulls.load(Ordering::SeqCst);
    wait_until("another pull", || a.control.pulls.load(Ordering::SeqCst) > pulls + 1).await;
    assert!(mesh.peer(PeerId(1)).is_some());
    assert!(mesh.peer(PeerId(2)).is_none());

    a.driver.terminate().await;
    b.driver.terminate().await;
}

#[tokio::test]
async fn test_credential_renewed_before_lease_runs_out() {
    let relay = TestRelay::start(1).await;
    let a = start_node_with_lease(1, &relay, &[1], fast_config(), Duration::from_secs(2)).await;
    let relay_manager = a.driver.relay().expect("relay manager");
    let initial = relay_manager.credential();

    wait_until("renewal", || a.control.renewals.load(Ordering::SeqCst) >= 1).await;
    assert!(a.driver.is_authenticated());
    wait_until("credential swapped", || relay_manager.credential() != initial).await;

    a.driver.terminate().await;
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let relay = TestRelay::start(1).await;
    let a = start_node(1, &relay, &[1], fast_config()).await;

    // The credential lease is an hour; shutdown must not wait on renewal.
    tokio::time::timeout(WAIT_TIMEOUT, a.driver.terminate())
        .await
        .expect("terminate finished");
    tokio::time::timeout(WAIT_TIMEOUT, a.driver.terminate())
        .await
        .expect("second terminate finished");
    assert!(a.driver.drive().is_err());
}
