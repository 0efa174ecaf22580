//! The SOCKS5 listener instances and per-connection handling.
//!
//! Each instance owns one TCP listener and a fixed hop count.  CONNECT
//! is handled entirely here as a one-shot exchange over an exit circuit;
//! UDP ASSOCIATE hands the session to the dispatcher and then just holds
//! the control connection open, since the association lives and dies
//! with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use murk_cell::CircId;
use murk_community::Community;
use murk_proto::{CircKind, CircState};
use murk_socks::{SocksAddr, SocksCmd, SocksProxyHandshake, SocksRequest, SocksStatus, UdpHeader};

use crate::dispatcher::{DispMsg, SessionGuard, SessionId};
use crate::{Error, Result};

/// Buffer for the SOCKS handshake.  A handshake that does not fit is
/// not one we want.
const HANDSHAKE_BUF: usize = 1024;

/// The most request bytes a CONNECT client may send before we tunnel
/// them.
const TCP_REQUEST_CAP: usize = 64 * 1024;

/// How long a CONNECT client gets to start sending its request.
const TCP_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(10);

/// A pause this long after the last request byte means the request is
/// complete.
const TCP_REQUEST_IDLE: Duration = Duration::from_millis(500);

/// Largest datagram a UDP ASSOCIATE session will relay.
const MAX_SOCKS_DATAGRAM: usize = 65_535;

/// Accept connections on one instance forever.
pub(crate) async fn run_instance(
    listener: TcpListener,
    hops: u8,
    community: Community,
    msgs: mpsc::UnboundedSender<DispMsg>,
) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(hops, "accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        trace!(hops, %from, "socks connection accepted");
        let community = community.clone();
        let msgs = msgs.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, hops, community, msgs).await {
                debug!(%from, "socks connection ended: {}", e);
            }
        });
    }
}

/// Run one SOCKS connection from handshake to completion.
async fn handle_connection(
    mut stream: TcpStream,
    hops: u8,
    community: Community,
    msgs: mpsc::UnboundedSender<DispMsg>,
) -> Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        // The handshake ended without a request; whatever reply was due
        // has been sent.
        return Ok(());
    };
    match request.cmd() {
        SocksCmd::CONNECT => handle_connect(stream, hops, &community, &request).await,
        SocksCmd::UDP_ASSOCIATE => handle_associate(stream, hops, msgs, &request).await,
        _ => {
            let reply = request.reply(SocksStatus::COMMAND_NOT_SUPPORTED, None);
            stream.write_all(&reply).await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

/// Drive the SOCKS handshake over `stream` until a request arrives.
///
/// Returns `Ok(None)` if the client hung up, or if the handshake ended
/// in a refusal that has already been written back.
async fn read_request(stream: &mut TcpStream) -> Result<Option<SocksRequest>> {
    let mut handshake = SocksProxyHandshake::new();
    let mut inbuf = [0_u8; HANDSHAKE_BUF];
    let mut n_read = 0;
    loop {
        let n = stream.read(&mut inbuf[n_read..]).await?;
        if n == 0 {
            return Ok(None);
        }
        n_read += n;

        let action = match handshake.handshake(&inbuf[..n_read]) {
            Err(murk_socks::Error::Truncated) => {
                if n_read == inbuf.len() {
                    return Err(Error::HandshakeTooLong(n_read));
                }
                continue;
            }
            Err(e) => return Err(e.into()),
            Ok(action) => action,
        };
        if action.drain > 0 {
            inbuf.copy_within(action.drain..n_read, 0);
            n_read -= action.drain;
        }
        if !action.reply.is_empty() {
            stream.write_all(&action.reply).await?;
            stream.flush().await?;
        }
        if action.finished {
            return Ok(handshake.into_request());
        }
    }
}

/// Serve a CONNECT: tunnel one request to an exit and relay the
/// response back.
async fn handle_connect(
    mut stream: TcpStream,
    hops: u8,
    community: &Community,
    request: &SocksRequest,
) -> Result<()> {
    let Some(dest) = resolve(request.addr(), request.port()).await else {
        debug!(addr = %request.addr(), "connect destination did not resolve");
        let reply = request.reply(SocksStatus::HOST_UNREACHABLE, None);
        stream.write_all(&reply).await?;
        stream.flush().await?;
        return Ok(());
    };

    // Tell the client to go ahead; the tunnel is set up while its
    // request trickles in.
    let reply = request.reply(SocksStatus::SUCCEEDED, None);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let Some(body) = read_request_body(&mut stream).await? else {
        return Ok(());
    };

    match perform_http_request(community, hops, dest, body).await {
        Ok(response) => {
            stream.write_all(&response).await?;
            stream.flush().await?;
            stream.shutdown().await?;
        }
        Err(e) => {
            // Close without a response; the client treats it as a
            // failed fetch and retries on its own schedule.
            debug!(%dest, "tunneled request failed: {}", e);
        }
    }
    Ok(())
}

/// Read the client's request bytes: everything it sends until it
/// pauses, hangs up, or hits the cap.
async fn read_request_body(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    let mut buf = [0_u8; 2048];

    match tokio::time::timeout(TCP_FIRST_BYTE_TIMEOUT, stream.read(&mut buf)).await {
        Err(_) | Ok(Ok(0)) => return Ok(None),
        Ok(Ok(n)) => body.extend_from_slice(&buf[..n]),
        Ok(Err(e)) => return Err(e.into()),
    }
    loop {
        if body.len() >= TCP_REQUEST_CAP {
            body.truncate(TCP_REQUEST_CAP);
            break;
        }
        match tokio::time::timeout(TCP_REQUEST_IDLE, stream.read(&mut buf)).await {
            Err(_) | Ok(Ok(0)) => break,
            Ok(Ok(n)) => body.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(Some(body))
}

/// Send `request` to `dest` over a data circuit of the right length and
/// wait for the response.
async fn perform_http_request(
    community: &Community,
    hops: u8,
    dest: SocketAddr,
    request: Vec<u8>,
) -> murk_community::Result<Vec<u8>> {
    let snapshot = community.circuits().await?;
    let eligible: Vec<CircId> = snapshot
        .iter()
        .filter(|c| c.kind == CircKind::Data && c.state == CircState::Ready)
        .filter(|c| c.goal_hops == hops)
        .map(|c| c.id)
        .collect();
    let picked = {
        let mut rng = rand::thread_rng();
        eligible.choose(&mut rng).copied()
    };
    let circ = match picked {
        Some(c) => c,
        None => {
            community
                .create_circuit(hops, CircKind::Data, None)
                .await?
                .wait_ready()
                .await?
        }
    };
    community.http_request(circ, dest, request).await
}

/// Turn a SOCKS destination into a socket address, resolving hostnames
/// locally.
async fn resolve(addr: &SocksAddr, port: u16) -> Option<SocketAddr> {
    if let Some(sa) = addr.to_socket_addr(port) {
        return Some(sa);
    }
    let SocksAddr::Hostname(name) = addr else {
        return None;
    };
    match tokio::net::lookup_host((name.as_str(), port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!(%name, "hostname lookup failed: {}", e);
            None
        }
    }
}

/// Serve a UDP ASSOCIATE: bind a relay socket, register the session
/// with the dispatcher, and hold the control connection until the
/// client hangs up.
async fn handle_associate(
    mut stream: TcpStream,
    hops: u8,
    msgs: mpsc::UnboundedSender<DispMsg>,
    request: &SocksRequest,
) -> Result<()> {
    let local_ip = stream.local_addr()?.ip();
    let udp = match UdpSocket::bind(SocketAddr::new(local_ip, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            let reply = request.reply(SocksStatus::GENERAL_FAILURE, None);
            stream.write_all(&reply).await?;
            stream.flush().await?;
            return Err(e.into());
        }
    };
    let bound = udp.local_addr()?;
    let udp = Arc::new(udp);

    let id = SessionId::fresh();
    let guard = Arc::new(SessionGuard);
    if msgs
        .send(DispMsg::NewSession {
            id,
            hops,
            udp: Arc::clone(&udp),
            guard: Arc::downgrade(&guard),
        })
        .is_err()
    {
        // Dispatcher gone; we are shutting down.
        return Ok(());
    }
    let reader = tokio::spawn(session_reader(id, udp, msgs.clone()));

    let reply = request.reply(SocksStatus::SUCCEEDED, Some(bound));
    stream.write_all(&reply).await?;
    stream.flush().await?;
    debug!(session = %id, %bound, hops, "udp associate session up");

    // Nothing further is defined on the control connection; wait for
    // the client to hang up, discarding anything it sends.
    let mut sink = [0_u8; 64];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    reader.abort();
    let _ = msgs.send(DispMsg::SessionClosed { id });
    drop(guard);
    debug!(session = %id, "udp associate session closed");
    Ok(())
}

/// Pull datagrams off a session's relay socket and hand them to the
/// dispatcher.
async fn session_reader(id: SessionId, udp: Arc<UdpSocket>, msgs: mpsc::UnboundedSender<DispMsg>) {
    let mut buf = vec![0_u8; MAX_SOCKS_DATAGRAM];
    loop {
        let (n, client) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                trace!(session = %id, "udp read failed: {}", e);
                continue;
            }
        };
        let (header, payload) = match UdpHeader::decode(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(session = %id, "malformed datagram dropped: {}", e);
                continue;
            }
        };
        if header.frag != 0 {
            // Fragmented relaying is optional and we do not offer it.
            continue;
        }
        let Some(dest) = resolve(&header.addr, header.port).await else {
            trace!(session = %id, addr = %header.addr, "undeliverable datagram dropped");
            continue;
        };
        let msg = DispMsg::Datagram {
            id,
            client,
            dest,
            payload: payload.to_vec(),
        };
        if msgs.send(msg).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    use murk_community::CommunityConfig;
    use murk_proto::TunnelKeypair;

    /// A full front (community plus proxy) on loopback, with no peers
    /// and no circuits.
    async fn spawn_front() -> (crate::Proxy, SocketAddr) {
        let config = CommunityConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            min_circuits: 0,
            ..CommunityConfig::default()
        };
        let keypair = {
            let mut rng = rand::thread_rng();
            TunnelKeypair::generate(&mut rng)
        };
        let handles = murk_community::launch(config, keypair).await.unwrap();
        let proxy = crate::launch(
            handles.community,
            crate::ProxyConfig {
                socks_listen_ports: vec![0],
            },
            handles.inbound,
            handles.circuit_events,
        )
        .await
        .unwrap();
        let addr = proxy.listen_addrs()[0];
        (proxy, addr)
    }

    /// Complete the method negotiation, expecting no-auth.
    async fn negotiate(stream: &mut TcpStream) {
        stream.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0_u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);
    }

    #[tokio::test]
    async fn connect_to_an_ip_gets_a_go_ahead() {
        let (_proxy, addr) = spawn_front().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut stream).await;

        // CONNECT 198.51.100.5:80.
        stream
            .write_all(&[5, 1, 0, 1, 198, 51, 100, 5, 0, 80])
            .await
            .unwrap();
        let mut reply = [0_u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 5);
        assert_eq!(u8::from(SocksStatus::SUCCEEDED), reply[1]);

        // With no peers the tunnel cannot be built, so after the
        // request the proxy closes without a response.
        stream
            .write_all(b"GET /announce HTTP/1.0\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0_u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(30), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn unresolvable_hostname_is_refused() {
        let (_proxy, addr) = spawn_front().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut stream).await;

        // CONNECT to a hostname under the reserved .invalid TLD.
        let name = b"tracker.invalid";
        let mut req = vec![5, 1, 0, 3, name.len() as u8];
        req.extend_from_slice(name);
        req.extend_from_slice(&[0, 80]);
        stream.write_all(&req).await.unwrap();

        let mut reply = [0_u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(u8::from(SocksStatus::HOST_UNREACHABLE), reply[1]);
    }

    #[tokio::test]
    async fn associate_reply_names_the_relay_socket() {
        let (_proxy, addr) = spawn_front().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        negotiate(&mut stream).await;

        // UDP ASSOCIATE with the all-zero client address.
        stream
            .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0_u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(u8::from(SocksStatus::SUCCEEDED), reply[1]);
        assert_eq!(reply[3], 1);
        let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
        let port = u16::from_be_bytes([reply[8], reply[9]]);
        assert_eq!(ip, std::net::Ipv4Addr::LOCALHOST);
        assert_ne!(port, 0);

        // A datagram to the relay must at least be accepted and parsed.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let header = UdpHeader {
            frag: 0,
            addr: SocksAddr::Ip(std::net::IpAddr::V4([198, 51, 100, 9].into())),
            port: 6881,
        };
        client
            .send_to(&header.encode(b"ping"), (ip, port))
            .await
            .unwrap();

        // Closing the control connection tears the session down.
        drop(stream);
    }

    #[tokio::test]
    async fn wrong_socks_version_gets_the_door() {
        let (_proxy, addr) = spawn_front().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[4, 1, 0]).await.unwrap();
        let mut buf = [0_u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
