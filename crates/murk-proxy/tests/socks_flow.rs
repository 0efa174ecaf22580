//! The whole local stack in one piece: a SOCKS5 client, the proxy front,
//! a community, and one exit relay, all over loopback sockets.
//!
//! Datagram tests retry their sends; the first few may land while the
//! exit candidate is still being verified or a circuit is still being
//! built, and dropping them is exactly what a datagram proxy is allowed
//! to do.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Instant};

use murk_community::{launch as launch_community, Community, CommunityConfig, CommunityHandles};
use murk_proto::{CircKind, TunnelKeypair};
use murk_proxy::{launch, Proxy, ProxyConfig};
use murk_socks::{SocksAddr, UdpHeader};

/// How long a test is willing to wait for the overlay to settle.
const SETTLE: Duration = Duration::from_secs(30);

/// Start a community on a loopback port with the pool disabled.
async fn spawn_peer(relay: bool, exit: bool) -> CommunityHandles {
    let config = CommunityConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        min_circuits: 0,
        relay_enabled: relay,
        exit_enabled: exit,
        ..CommunityConfig::default()
    };
    let keypair = {
        let mut rng = rand::thread_rng();
        TunnelKeypair::generate(&mut rng)
    };
    launch_community(config, keypair).await.unwrap()
}

/// Stand up the whole front: a community that knows one exit relay, and
/// a single SOCKS instance on an ephemeral port.
async fn spawn_stack() -> (Proxy, Community, CommunityHandles) {
    let exit = spawn_peer(true, true).await;
    let front = spawn_peer(false, false).await;
    front
        .community
        .add_candidate(exit.community.local_descriptor().clone());

    let community = front.community.clone();
    let proxy = launch(
        front.community.clone(),
        ProxyConfig {
            socks_listen_ports: vec![0],
        },
        front.inbound,
        front.circuit_events,
    )
    .await
    .unwrap();
    (proxy, community, exit)
}

/// Block until at least one candidate has answered a probe.
async fn wait_verified(community: &Community) {
    let deadline = Instant::now() + SETTLE;
    loop {
        if !community.verified_candidates().await.unwrap().is_empty() {
            return;
        }
        assert!(Instant::now() < deadline, "exit never verified");
        sleep(Duration::from_millis(100)).await;
    }
}

/// Run the method negotiation on a fresh SOCKS connection.
async fn negotiate(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0]);
    stream
}

/// Issue UDP ASSOCIATE and return the relay address from the reply.
async fn associate(stream: &mut TcpStream) -> SocketAddr {
    stream
        .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 5);
    assert_eq!(reply[1], 0, "associate was refused");
    assert_eq!(reply[3], 1, "expected an IPv4 bound address");
    let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_ne!(port, 0);
    SocketAddr::new(ip.into(), port)
}

/// Frame a payload for `dest` the way a SOCKS client does.
fn framed(dest: SocketAddr, payload: &[u8]) -> Vec<u8> {
    UdpHeader {
        frag: 0,
        addr: SocksAddr::Ip(dest.ip()),
        port: dest.port(),
    }
    .encode(payload)
}

/// A UDP server that echoes every datagram it gets, forever.
async fn echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

#[tokio::test]
async fn udp_associate_relays_through_the_overlay() {
    let server = echo_server().await;
    let (proxy, _community, exit) = spawn_stack().await;

    let mut control = negotiate(proxy.listen_addrs()[0]).await;
    let relay = associate(&mut control).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = framed(server, b"hello");

    // Resend until a reply makes it back through the tunnel.
    let deadline = Instant::now() + SETTLE;
    let mut buf = [0u8; 2048];
    let n = loop {
        client.send_to(&request, relay).await.unwrap();
        match timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                assert_eq!(from, relay);
                break n;
            }
            Ok(Err(e)) => panic!("recv failed: {e}"),
            Err(_) => assert!(Instant::now() < deadline, "no reply through the tunnel"),
        }
    };

    let (header, payload) = UdpHeader::decode(&buf[..n]).unwrap();
    assert_eq!(header.frag, 0);
    assert_eq!(header.addr, SocksAddr::Ip(server.ip()));
    assert_eq!(header.port, server.port());
    assert_eq!(payload, b"hello");

    proxy.shutdown();
    exit.community.shutdown();
}

#[tokio::test]
async fn early_datagrams_share_one_circuit_in_order() {
    let server = echo_server().await;
    let (proxy, community, exit) = spawn_stack().await;
    wait_verified(&community).await;

    let mut control = negotiate(proxy.listen_addrs()[0]).await;
    let relay = associate(&mut control).await;

    // Two datagrams back to back, before any circuit exists.  The first
    // starts the build, the second queues behind it; both come out the
    // far end in arrival order.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&framed(server, b"one"), relay).await.unwrap();
    client.send_to(&framed(server, b"two"), relay).await.unwrap();

    let mut buf = [0u8; 2048];
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let (n, _) = timeout(SETTLE, client.recv_from(&mut buf))
            .await
            .expect("queued datagram never came back")
            .unwrap();
        let (_, payload) = UdpHeader::decode(&buf[..n]).unwrap();
        seen.push(payload.to_vec());
    }
    assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);

    // One session, one build: the whole exchange rode a single circuit.
    let circuits = community.circuits().await.unwrap();
    assert_eq!(circuits.len(), 1);
    assert_eq!(circuits[0].kind, CircKind::Data);
    assert_eq!(circuits[0].goal_hops, 1);

    proxy.shutdown();
    exit.community.shutdown();
}

#[tokio::test]
async fn connect_proxies_an_http_exchange() {
    // A one-request origin server that answers and hangs up.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = origin.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = conn.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if n == 0 || buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        assert!(buf.starts_with(b"GET /"));
        conn.write_all(b"HTTP/1.0 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let (proxy, community, exit) = spawn_stack().await;
    wait_verified(&community).await;

    let mut stream = negotiate(proxy.listen_addrs()[0]).await;
    let SocketAddr::V4(v4) = origin_addr else {
        panic!("origin bound to something other than IPv4");
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0, "connect was refused");

    stream
        .write_all(b"GET / HTTP/1.0\r\nhost: origin\r\n\r\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(SETTLE, stream.read_to_end(&mut response))
        .await
        .expect("no response through the tunnel")
        .unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.0 200 OK"), "got: {text}");
    assert!(text.ends_with("ok"), "got: {text}");

    proxy.shutdown();
    exit.community.shutdown();
}
