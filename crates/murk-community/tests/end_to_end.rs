//! End-to-end exercises over real UDP sockets on the loopback range.
//!
//! Each test stands up a handful of communities on distinct loopback
//! addresses, wires them together with `add_candidate`, and pushes real
//! datagrams through the resulting circuits.  Candidate verification and
//! relay housekeeping run on the reactor's own tick, so anything that
//! depends on them retries under a deadline instead of sleeping a fixed
//! amount.

#![allow(clippy::unwrap_used)]

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

use murk_cell::{CircId, PeerDescriptor};
use murk_community::{
    launch, CircuitEvent, Community, CommunityConfig, CommunityHandles, Error, InboundData,
};
use murk_proto::{CircKind, CircState, TunnelKeypair};

/// How long a test is willing to wait for the overlay to settle.
const SETTLE: Duration = Duration::from_secs(30);

/// Start a community bound to `ip`, with the pool disabled so the only
/// circuits are the ones the test builds.
async fn spawn_peer(ip: &str, relay: bool, exit: bool) -> CommunityHandles {
    spawn_peer_with(ip, relay, exit, |_| ()).await
}

/// Like [`spawn_peer`], with a hook for bending the config.
async fn spawn_peer_with(
    ip: &str,
    relay: bool,
    exit: bool,
    tweak: impl FnOnce(&mut CommunityConfig),
) -> CommunityHandles {
    let mut config = CommunityConfig {
        listen_addr: SocketAddr::new(ip.parse::<IpAddr>().unwrap(), 0),
        min_circuits: 0,
        relay_enabled: relay,
        exit_enabled: exit,
        ..CommunityConfig::default()
    };
    tweak(&mut config);
    let keypair = {
        let mut rng = rand::thread_rng();
        TunnelKeypair::generate(&mut rng)
    };
    launch(config, keypair).await.unwrap()
}

/// Build a circuit, retrying while candidates are still being verified.
async fn build_circuit(
    community: &Community,
    goal_hops: u8,
    kind: CircKind,
    terminal: Option<PeerDescriptor>,
) -> CircId {
    let deadline = Instant::now() + SETTLE;
    loop {
        match community
            .create_circuit(goal_hops, kind, terminal.clone())
            .await
        {
            Ok(pending) => match pending.wait_ready().await {
                Ok(circ) => return circ,
                Err(Error::CircuitFailed) => {}
                Err(e) => panic!("circuit build died: {e}"),
            },
            Err(Error::NoCandidates | Error::Busy) => {}
            Err(e) => panic!("create refused: {e}"),
        }
        assert!(
            Instant::now() < deadline,
            "no {goal_hops}-hop circuit after {SETTLE:?}"
        );
        sleep(Duration::from_millis(100)).await;
    }
}

/// Receive one tunneled payload or panic.
async fn recv_inbound(handles: &mut CommunityHandles) -> InboundData {
    timeout(SETTLE, handles.inbound.recv())
        .await
        .expect("no tunneled payload arrived")
        .expect("inbound stream closed")
}

/// A plain UDP server that answers the first datagram and reports what
/// it saw.
async fn one_shot_udp_server(
    reply: &'static [u8],
) -> (SocketAddr, tokio::task::JoinHandle<(Vec<u8>, SocketAddr)>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        socket.send_to(reply, from).await.unwrap();
        (buf[..n].to_vec(), from)
    });
    (addr, handle)
}

#[tokio::test]
async fn one_hop_exit_carries_udp_both_ways() {
    let (server_addr, server) = one_shot_udp_server(b"world").await;

    let exit = spawn_peer("127.0.0.1", true, true).await;
    let mut client = spawn_peer("127.0.0.1", false, false).await;
    client
        .community
        .add_candidate(exit.community.local_descriptor().clone());

    let circ = build_circuit(&client.community, 1, CircKind::Data, None).await;
    client
        .community
        .send_data(circ, server_addr, b"hello".to_vec());

    let (seen, from) = timeout(SETTLE, server).await.unwrap().unwrap();
    assert_eq!(seen, b"hello");
    // The server answered the exit's socket, never the client's.
    assert_ne!(from.port(), client.community.local_descriptor().addr.port());

    let got = recv_inbound(&mut client).await;
    assert_eq!(got.circ, circ);
    assert_eq!(got.kind, CircKind::Data);
    assert_eq!(got.hops, 1);
    assert_eq!(got.orig, server_addr);
    assert_eq!(got.payload, b"world");

    client.community.shutdown();
    exit.community.shutdown();
}

#[tokio::test]
async fn extended_chain_reaches_the_exit() {
    let (server_addr, server) = one_shot_udp_server(b"pong").await;

    // Hop selection refuses to reuse an IP, so the chain spans three
    // loopback addresses: client, middle relay, exit.
    let middle = spawn_peer("127.0.0.2", true, false).await;
    let exit = spawn_peer("127.0.0.3", true, true).await;
    let mut client = spawn_peer("127.0.0.1", false, false).await;

    let middle_desc = middle.community.local_descriptor().clone();
    let exit_desc = exit.community.local_descriptor().clone();
    client.community.add_candidate(middle_desc.clone());

    let circ = build_circuit(
        &client.community,
        2,
        CircKind::Data,
        Some(exit_desc.clone()),
    )
    .await;

    let info = client
        .community
        .circuits()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.id == circ)
        .unwrap();
    assert_eq!(info.state, CircState::Ready);
    assert_eq!(info.hop_count, 2);
    assert_eq!(info.hops, vec![middle_desc.id, exit_desc.id]);

    client
        .community
        .send_data(circ, server_addr, b"ping".to_vec());

    let (seen, _) = timeout(SETTLE, server).await.unwrap().unwrap();
    assert_eq!(seen, b"ping");

    let got = recv_inbound(&mut client).await;
    assert_eq!(got.circ, circ);
    assert_eq!(got.hops, 2);
    assert_eq!(got.orig, server_addr);
    assert_eq!(got.payload, b"pong");

    client.community.shutdown();
    middle.community.shutdown();
    exit.community.shutdown();
}

#[tokio::test]
async fn mid_path_teardown_reaches_the_owner() {
    let (server_addr, server) = one_shot_udp_server(b"here").await;

    // The middle relay retires quiet legs almost immediately; the
    // teardown has to propagate back to the circuit's owner.
    let middle = spawn_peer_with("127.0.0.2", true, false, |c| {
        c.max_circuit_age = Duration::from_secs(1);
    })
    .await;
    let exit = spawn_peer("127.0.0.3", true, true).await;
    let mut client = spawn_peer("127.0.0.1", false, false).await;

    let middle_desc = middle.community.local_descriptor().clone();
    let exit_desc = exit.community.local_descriptor().clone();
    client.community.add_candidate(middle_desc.clone());

    let circ = build_circuit(
        &client.community,
        2,
        CircKind::Data,
        Some(exit_desc.clone()),
    )
    .await;
    client
        .community
        .send_data(circ, server_addr, b"anyone".to_vec());
    let (_, _) = timeout(SETTLE, server).await.unwrap().unwrap();
    let got = recv_inbound(&mut client).await;
    assert_eq!(got.payload, b"here");

    // Go quiet and wait for the relay to kill the leg.  Earlier build
    // attempts may have left teardown notices of their own behind.
    let deadline = Instant::now() + SETTLE;
    loop {
        let event = timeout(deadline - Instant::now(), client.circuit_events.recv())
            .await
            .expect("no teardown notice arrived")
            .expect("event stream closed");
        let CircuitEvent::Closed { circ: dead, kind } = event;
        if dead == circ {
            assert_eq!(kind, CircKind::Data);
            break;
        }
    }

    let remaining = client.community.circuits().await.unwrap();
    assert!(remaining.iter().all(|c| c.id != circ));

    // Both relays on the dead path earned their bytes exactly once.
    let payouts = client.community.payouts().await.unwrap();
    let middle_total = payouts
        .iter()
        .find(|(id, _)| *id == middle_desc.id)
        .map(|(_, b)| *b)
        .unwrap_or(0);
    let exit_total = payouts
        .iter()
        .find(|(id, _)| *id == exit_desc.id)
        .map(|(_, b)| *b)
        .unwrap_or(0);
    assert!(middle_total > 0);
    assert_eq!(middle_total, exit_total);

    // Life goes on: a replacement circuit comes up under a fresh id.
    let fresh = build_circuit(&client.community, 2, CircKind::Data, Some(exit_desc)).await;
    assert_ne!(fresh, circ);

    client.community.shutdown();
    middle.community.shutdown();
    exit.community.shutdown();
}
