//! The relay plane: carrying other peers' circuits through this peer.
//!
//! Where [`reactor`](crate::reactor) handles circuits we own, this module
//! handles circuits owned by someone else.  Each one shows up here as a
//! **leg**: the link-level neighbor it arrives from plus the circuit id it
//! uses on that link.  For every leg we hold one onion layer; outbound
//! cells get that layer peeled, inbound cells get it added.
//!
//! What happens after the peel depends on the leg's splice:
//!
//! * spliced onward: we extended the circuit earlier, forward the cell to
//!   the next peer under its outgoing circuit id;
//! * spliced to another leg: we are a rendezvous point and the two legs
//!   form one end-to-end path;
//! * no splice: we are the terminal hop, and the peeled payload is a
//!   message addressed to us (EXTEND, DATA to exit, a rendezvous request,
//!   a tunneled TCP exchange).
//!
//! Exit traffic and tunneled TCP run on spawned tasks; they report back
//! over the reactor's task channel so all table mutations stay on the
//! reactor.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use murk_cell::msg::{
    AnyMsg, Data, DestroyReason, EstablishIntro, EstablishRendezvous, Extend, Extended,
    HttpRequest, HttpResponse, IntroEstablished, Introduce1, Introduce2, Ping, Pong,
    Rendezvous1, Rendezvous2, RendezvousEstablished,
};
use murk_cell::{CellCmd, CircId, RawCell, RendCookie, ServiceId};
use murk_proto::handshake;
use murk_proto::HopLayer;

use crate::reactor::{destroy_cell, Reactor, TaskMsg};

/// Longest a relayed TCP exchange may run before the exit gives up.
const EXIT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
/// Most bytes an exit reads back from a TCP endpoint for one exchange.
const EXIT_HTTP_MAX_RESPONSE: usize = 64 * 1024;

/// One relayed circuit on one link: who it comes from and which id it
/// uses there.
pub(crate) type LegKey = (SocketAddr, CircId);

/// Where a leg's outbound traffic goes after its layer is peeled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SpliceTarget {
    /// Forward to the next relay; we extended the circuit there.
    Onward {
        /// The next relay's overlay address.
        addr: SocketAddr,
        /// The circuit id we allocated on that link.
        circ: CircId,
    },
    /// Forward into another leg; we are this circuit's rendezvous point.
    Rendezvous {
        /// The partner leg.
        leg: LegKey,
    },
}

/// One relayed circuit's state at this peer.
#[derive(Debug)]
pub(crate) struct Leg {
    /// The onion layer shared with this circuit's owner.
    pub(crate) layer: HopLayer,
    /// Where peeled outbound traffic goes; `None` while we are terminal.
    pub(crate) splice: Option<SpliceTarget>,
    /// When this leg last carried a cell.
    pub(crate) last_seen: Instant,
}

/// An extend we passed on and whose CREATED has not come back yet.
#[derive(Debug)]
pub(crate) struct PendingExtend {
    /// The leg that asked for the extension.
    pub(crate) in_leg: LegKey,
    /// When the CREATE went out.
    pub(crate) since: Instant,
}

/// An exit UDP socket serving one leg, with its reader task.
#[derive(Debug)]
pub(crate) struct ExitSocket {
    /// The socket cleartext leaves from.
    pub(crate) socket: Arc<UdpSocket>,
    /// Task feeding replies back to the reactor; aborted with the leg.
    pub(crate) task: JoinHandle<()>,
}

/// An introduction-point registration for one hidden service.
#[derive(Debug)]
pub(crate) struct IntroPoint {
    /// The leg leading back to the service.
    pub(crate) leg: LegKey,
}

/// Everything this peer tracks about circuits it relays.
#[derive(Debug, Default)]
pub(crate) struct RelayState {
    /// Live legs by (neighbor, circuit id on that link).
    pub(crate) legs: HashMap<LegKey, Leg>,
    /// Reverse splice lookup: outgoing link back to the leg it serves.
    pub(crate) out_index: HashMap<LegKey, LegKey>,
    /// Extensions awaiting their CREATED, keyed by the outgoing link.
    pub(crate) pending_extends: HashMap<LegKey, PendingExtend>,
    /// Lazily created exit sockets, one per exiting leg.
    pub(crate) exits: HashMap<LegKey, ExitSocket>,
    /// Services we act as an introduction point for.
    pub(crate) intro_points: HashMap<ServiceId, IntroPoint>,
    /// Cookies waiting for their RENDEZVOUS1, each tied to one leg.
    pub(crate) rend_points: HashMap<RendCookie, LegKey>,
}

impl Reactor {
    /// Accept a CREATE cell: become a hop of someone else's circuit.
    pub(crate) async fn handle_relay_create(
        &mut self,
        from: SocketAddr,
        circ: CircId,
        payload: &[u8],
    ) {
        if !self.config.relay_enabled {
            trace!(%from, "ignoring CREATE; relaying is disabled");
            return;
        }
        let key = (from, circ);
        if self.relay.legs.contains_key(&key) {
            warn!(%from, %circ, "duplicate CREATE for a live leg");
            return;
        }
        let handshake_msg = match AnyMsg::decode_payload(CellCmd::CREATE, payload) {
            Ok(AnyMsg::Create(c)) => c.handshake,
            _ => {
                trace!(%from, "malformed CREATE");
                return;
            }
        };
        match handshake::server(&mut self.rng, &self.keypair, &handshake_msg) {
            Ok((keys, reply)) => {
                self.relay.legs.insert(
                    key,
                    Leg {
                        layer: HopLayer::new(&keys),
                        splice: None,
                        last_seen: Instant::now(),
                    },
                );
                trace!(%from, %circ, "new relayed leg");
                self.send_cell(from, RawCell::new(Some(circ), CellCmd::CREATED, reply))
                    .await;
            }
            Err(e) => {
                debug!(%from, "refusing CREATE with a bad handshake: {}", e);
                self.send_cell(from, destroy_cell(circ, DestroyReason::PROTOCOL))
                    .await;
            }
        }
    }

    /// Accept a CREATED answering an extension we passed on.
    ///
    /// Returns false if no pending extension matches.
    pub(crate) async fn handle_relay_created(
        &mut self,
        from: SocketAddr,
        circ: CircId,
        payload: &[u8],
    ) -> bool {
        let key = (from, circ);
        let Some(pending) = self.relay.pending_extends.remove(&key) else {
            return false;
        };
        if !self.relay.legs.contains_key(&pending.in_leg) {
            // The asking circuit died while we waited.
            self.send_cell(from, destroy_cell(circ, DestroyReason::NONE))
                .await;
            return true;
        }
        let reply = match AnyMsg::decode_payload(CellCmd::CREATED, payload) {
            Ok(AnyMsg::Created(c)) => c.handshake,
            _ => {
                trace!(%from, "malformed CREATED");
                self.teardown_leg(pending.in_leg, DestroyReason::PROTOCOL, true, false)
                    .await;
                return true;
            }
        };
        self.relay.out_index.insert(key, pending.in_leg);
        if let Some(leg) = self.relay.legs.get_mut(&pending.in_leg) {
            leg.splice = Some(SpliceTarget::Onward { addr: from, circ });
        }
        trace!(%from, %circ, "extension completed; leg spliced onward");
        let Ok(body) = AnyMsg::from(Extended { handshake: reply }).encode_payload() else {
            return true;
        };
        self.seal_and_send_inward(pending.in_leg, CellCmd::EXTENDED, &body)
            .await;
        true
    }

    /// Handle a DESTROY that concerns the relay plane.
    ///
    /// Returns false if nothing here matches it.
    pub(crate) async fn handle_relay_destroy(
        &mut self,
        from: SocketAddr,
        circ: CircId,
        reason: DestroyReason,
    ) -> bool {
        let key = (from, circ);
        if self.relay.legs.contains_key(&key) {
            // The owner's side is tearing down; pass it along outward.
            self.teardown_leg(key, reason, false, true).await;
            return true;
        }
        if let Some(in_leg) = self.relay.out_index.remove(&key) {
            // The far side is tearing down; pass it along inward.
            self.teardown_leg(in_leg, reason, true, false).await;
            return true;
        }
        if let Some(pending) = self.relay.pending_extends.remove(&key) {
            self.teardown_leg(pending.in_leg, reason, true, false).await;
            return true;
        }
        false
    }

    /// Relay a cell arriving from a leg's inward side: peel our layer and
    /// move it along.
    pub(crate) async fn relay_outbound(&mut self, key: LegKey, cell: &RawCell) {
        let (peeled, splice) = match self.relay.legs.get_mut(&key) {
            Some(leg) => {
                leg.last_seen = Instant::now();
                (leg.layer.open_outbound(cell.payload()), leg.splice.clone())
            }
            None => return,
        };
        let peeled = match peeled {
            Ok(p) => p,
            Err(_) => {
                debug!(from = %key.0, circ = %key.1, "bad layer MAC; tearing leg down");
                self.teardown_leg(key, DestroyReason::PROTOCOL, true, true)
                    .await;
                return;
            }
        };
        match splice {
            Some(SpliceTarget::Onward { addr, circ }) => {
                self.send_cell(addr, RawCell::new(Some(circ), cell.cmd(), peeled))
                    .await;
            }
            Some(SpliceTarget::Rendezvous { leg }) => {
                self.seal_and_send_inward(leg, cell.cmd(), &peeled).await;
            }
            None => self.terminal_cell(key, cell.cmd(), &peeled).await,
        }
    }

    /// Relay a cell arriving from a leg's onward side: add our layer and
    /// send it inward.
    pub(crate) async fn relay_inbound(&mut self, in_leg: LegKey, cell: &RawCell) {
        self.seal_and_send_inward(in_leg, cell.cmd(), cell.payload())
            .await;
    }

    /// Seal `plain` under a leg's layer and send it toward the owner.
    pub(crate) async fn seal_and_send_inward(&mut self, leg: LegKey, cmd: CellCmd, plain: &[u8]) {
        let sealed = match self.relay.legs.get_mut(&leg) {
            Some(l) => {
                l.last_seen = Instant::now();
                l.layer.seal_inbound(plain)
            }
            None => return,
        };
        match sealed {
            Ok(bytes) => {
                self.send_cell(leg.0, RawCell::new(Some(leg.1), cmd, bytes))
                    .await;
            }
            Err(_) => {
                // Sequence space exhausted; the leg cannot continue.
                self.teardown_leg(leg, DestroyReason::INTERNAL, true, true)
                    .await;
            }
        }
    }

    /// Interpret a fully peeled cell addressed to us as the terminal hop.
    async fn terminal_cell(&mut self, key: LegKey, cmd: CellCmd, plain: &[u8]) {
        let msg = match AnyMsg::decode_payload(cmd, plain) {
            Ok(m) => m,
            Err(_) => {
                debug!(circ = %key.1, cmd = %cmd, "malformed terminal payload");
                self.teardown_leg(key, DestroyReason::PROTOCOL, true, false)
                    .await;
                return;
            }
        };
        match msg {
            AnyMsg::Extend(ex) => self.terminal_extend(key, ex).await,
            AnyMsg::Data(d) => self.terminal_data(key, d).await,
            AnyMsg::Ping(Ping { nonce }) => {
                let Ok(body) = AnyMsg::from(Pong { nonce }).encode_payload() else {
                    return;
                };
                self.seal_and_send_inward(key, CellCmd::PONG, &body).await;
            }
            AnyMsg::EstablishIntro(ei) => self.terminal_establish_intro(key, ei).await,
            AnyMsg::EstablishRendezvous(er) => self.terminal_establish_rendezvous(key, er).await,
            AnyMsg::Rendezvous1(r1) => self.terminal_rendezvous1(key, r1).await,
            AnyMsg::HttpRequest(hr) => self.terminal_http_request(key, hr),
            other => {
                debug!(cmd = %other.cmd(), "unexpected terminal cell");
                self.teardown_leg(key, DestroyReason::PROTOCOL, true, false)
                    .await;
            }
        }
    }

    /// Extend the circuit by one hop on the owner's behalf.
    async fn terminal_extend(&mut self, key: LegKey, ex: Extend) {
        if ex.peer.addr == self.local.addr || ex.peer.id == self.local.id {
            debug!(circ = %key.1, "refusing to extend a circuit back to ourselves");
            self.teardown_leg(key, DestroyReason::PROTOCOL, true, false)
                .await;
            return;
        }
        let out_circ = self.alloc_circ_id(ex.peer.addr);
        self.relay.pending_extends.insert(
            (ex.peer.addr, out_circ),
            PendingExtend {
                in_leg: key,
                since: Instant::now(),
            },
        );
        trace!(circ = %key.1, next = %ex.peer.id, out_circ = %out_circ, "extending onward");
        self.send_cell(
            ex.peer.addr,
            RawCell::new(Some(out_circ), CellCmd::CREATE, ex.handshake),
        )
        .await;
    }

    /// Exit a tunneled datagram to the Internet.
    async fn terminal_data(&mut self, key: LegKey, d: Data) {
        if d.dest == Data::unset_addr() {
            trace!(circ = %key.1, "tunneled datagram with no destination");
            return;
        }
        if !self.relay.exits.contains_key(&key) {
            if let Err(e) = self.spawn_exit(key).await {
                debug!(circ = %key.1, "could not open an exit socket: {}", e);
                return;
            }
        }
        if let Some(exit) = self.relay.exits.get(&key) {
            if let Err(e) = exit.socket.send_to(&d.payload, d.dest).await {
                trace!(dest = %d.dest, "exit send failed: {}", e);
            }
        }
    }

    /// Bind this leg's exit socket and start its reader task.
    async fn spawn_exit(&mut self, key: LegKey) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        let reader = Arc::clone(&socket);
        let tx = self.task_tx.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0_u8; 65_535];
            loop {
                match reader.recv_from(&mut buf).await {
                    Ok((n, orig)) => {
                        let msg = TaskMsg::ExitInbound {
                            leg: key,
                            orig,
                            payload: buf[..n].to_vec(),
                        };
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        debug!(circ = %key.1, local = ?socket.local_addr(), "exit socket opened");
        self.relay.exits.insert(key, ExitSocket { socket, task });
        Ok(())
    }

    /// Tunnel an exit socket's reply inward along its leg.
    pub(crate) async fn handle_exit_inbound(
        &mut self,
        leg: LegKey,
        orig: SocketAddr,
        payload: Vec<u8>,
    ) {
        if !self.relay.legs.contains_key(&leg) {
            return;
        }
        let body = Data {
            dest: Data::unset_addr(),
            orig,
            payload,
        };
        let Ok(plain) = AnyMsg::from(body).encode_payload() else {
            return;
        };
        self.seal_and_send_inward(leg, CellCmd::DATA, &plain).await;
    }

    /// Register as an introduction point for a hidden service.
    ///
    /// The registration must exhibit the key behind the identity it
    /// claims; a mismatched one gets no acknowledgement.
    async fn terminal_establish_intro(&mut self, key: LegKey, ei: EstablishIntro) {
        if handshake::service_id_for_key(&ei.auth_key) != ei.service {
            debug!(service = %ei.service, circ = %key.1, "ESTABLISH_INTRO key does not match its service id");
            return;
        }
        debug!(service = %ei.service, circ = %key.1, "acting as introduction point");
        self.relay
            .intro_points
            .insert(ei.service, IntroPoint { leg: key });
        let Ok(body) = AnyMsg::from(IntroEstablished {}).encode_payload() else {
            return;
        };
        self.seal_and_send_inward(key, CellCmd::INTRO_ESTABLISHED, &body)
            .await;
    }

    /// Register as a rendezvous point for one cookie.
    async fn terminal_establish_rendezvous(&mut self, key: LegKey, er: EstablishRendezvous) {
        debug!(circ = %key.1, "acting as rendezvous point");
        self.relay.rend_points.insert(er.cookie, key);
        let Ok(body) = AnyMsg::from(RendezvousEstablished {}).encode_payload() else {
            return;
        };
        self.seal_and_send_inward(key, CellCmd::RENDEZVOUS_ESTABLISHED, &body)
            .await;
    }

    /// Complete a rendezvous: splice this leg to the one that presented
    /// the matching cookie, and forward the handshake to the downloader.
    async fn terminal_rendezvous1(&mut self, key: LegKey, r1: Rendezvous1) {
        // Cookies are single use; unknown ones are simply discarded.
        let Some(dl_leg) = self.relay.rend_points.remove(&r1.cookie) else {
            debug!(circ = %key.1, "RENDEZVOUS1 with an unknown cookie");
            return;
        };
        if !self.relay.legs.contains_key(&dl_leg) {
            debug!(circ = %key.1, "rendezvous partner leg is gone");
            return;
        }
        if let Some(leg) = self.relay.legs.get_mut(&key) {
            leg.splice = Some(SpliceTarget::Rendezvous { leg: dl_leg });
        }
        if let Some(leg) = self.relay.legs.get_mut(&dl_leg) {
            leg.splice = Some(SpliceTarget::Rendezvous { leg: key });
        }
        debug!(seeder = %key.1, downloader = %dl_leg.1, "spliced rendezvous circuits");
        let Ok(body) = AnyMsg::from(Rendezvous2 {
            handshake: r1.handshake,
        })
        .encode_payload() else {
            return;
        };
        self.seal_and_send_inward(dl_leg, CellCmd::RENDEZVOUS2, &body)
            .await;
    }

    /// Run one TCP request/response exchange on the owner's behalf.
    ///
    /// A failed exchange still gets an answer, just an empty one, so the
    /// owner's timeout is the only thing that can leave it hanging.
    fn terminal_http_request(&mut self, key: LegKey, hr: HttpRequest) {
        let tx = self.task_tx.clone();
        let HttpRequest {
            request_id,
            dest,
            request,
        } = hr;
        trace!(circ = %key.1, %dest, "running tunneled TCP exchange");
        tokio::spawn(async move {
            let response = exit_http_exchange(dest, &request).await.unwrap_or_default();
            let _ = tx
                .send(TaskMsg::HttpDone {
                    leg: key,
                    request_id,
                    response,
                })
                .await;
        });
    }

    /// Send a finished TCP exchange's response inward along its leg.
    pub(crate) async fn handle_http_done(
        &mut self,
        leg: LegKey,
        request_id: u32,
        response: Vec<u8>,
    ) {
        if !self.relay.legs.contains_key(&leg) {
            return;
        }
        let Ok(body) = AnyMsg::from(HttpResponse {
            request_id,
            response,
        })
        .encode_payload() else {
            return;
        };
        self.seal_and_send_inward(leg, CellCmd::HTTP_RESPONSE, &body)
            .await;
    }

    /// Forward an introduction to the service it names, if we are its
    /// introduction point.
    pub(crate) async fn handle_introduce1(&mut self, intro: Introduce1) {
        let Some(ip) = self.relay.intro_points.get(&intro.service) else {
            trace!(service = %intro.service, "INTRODUCE1 for a service we do not serve");
            return;
        };
        let leg = ip.leg;
        debug!(service = %intro.service, "forwarding introduction to the service");
        let fwd: Introduce2 = intro.into();
        let Ok(body) = AnyMsg::from(fwd).encode_payload() else {
            return;
        };
        self.seal_and_send_inward(leg, CellCmd::INTRODUCE2, &body)
            .await;
    }

    /// Remove a leg and everything hanging off it, propagating DESTROY in
    /// the directions asked for.
    pub(crate) async fn teardown_leg(
        &mut self,
        key: LegKey,
        reason: DestroyReason,
        notify_inward: bool,
        notify_outward: bool,
    ) {
        let Some(leg) = self.relay.legs.remove(&key) else {
            return;
        };
        if let Some(exit) = self.relay.exits.remove(&key) {
            exit.task.abort();
        }
        self.relay.intro_points.retain(|_, ip| ip.leg != key);
        self.relay.rend_points.retain(|_, l| *l != key);
        let stale: Vec<LegKey> = self
            .relay
            .pending_extends
            .iter()
            .filter(|(_, pe)| pe.in_leg == key)
            .map(|(k, _)| *k)
            .collect();
        for k in stale {
            self.relay.pending_extends.remove(&k);
        }

        match leg.splice {
            Some(SpliceTarget::Onward { addr, circ }) => {
                self.relay.out_index.remove(&(addr, circ));
                if notify_outward {
                    self.send_cell(addr, destroy_cell(circ, reason)).await;
                }
            }
            Some(SpliceTarget::Rendezvous { leg: partner }) => {
                // The spliced path dies as a whole.
                if self.relay.legs.remove(&partner).is_some() {
                    if let Some(exit) = self.relay.exits.remove(&partner) {
                        exit.task.abort();
                    }
                    self.relay.intro_points.retain(|_, ip| ip.leg != partner);
                    self.relay.rend_points.retain(|_, l| *l != partner);
                    self.send_cell(partner.0, destroy_cell(partner.1, reason))
                        .await;
                }
            }
            None => {}
        }
        if notify_inward {
            self.send_cell(key.0, destroy_cell(key.1, reason)).await;
        }
        debug!(from = %key.0, circ = %key.1, reason = reason.human_str(), "leg torn down");
    }

    /// Relay housekeeping: expire extensions that never completed and
    /// legs that have gone quiet.
    pub(crate) async fn tick_relay(&mut self, now: Instant) {
        let overdue: Vec<LegKey> = self
            .relay
            .pending_extends
            .iter()
            .filter(|(_, pe)| now.duration_since(pe.since) >= self.config.extend_timeout)
            .map(|(k, _)| *k)
            .collect();
        for k in overdue {
            if let Some(pending) = self.relay.pending_extends.remove(&k) {
                debug!(next = %k.0, "extension through us timed out");
                self.teardown_leg(pending.in_leg, DestroyReason::TIMEOUT, true, false)
                    .await;
            }
        }

        let quiet: Vec<LegKey> = self
            .relay
            .legs
            .iter()
            .filter(|(_, l)| now.duration_since(l.last_seen) >= self.config.max_circuit_age)
            .map(|(k, _)| *k)
            .collect();
        for k in quiet {
            self.teardown_leg(k, DestroyReason::FINISHED, true, true).await;
        }
    }
}

/// Connect to `dest`, send `request`, and read the response until EOF,
/// a size cap, or a deadline.
async fn exit_http_exchange(dest: SocketAddr, request: &[u8]) -> Option<Vec<u8>> {
    let work = async {
        let mut stream = TcpStream::connect(dest).await.ok()?;
        stream.write_all(request).await.ok()?;
        stream.shutdown().await.ok()?;
        let mut response = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.len() >= EXIT_HTTP_MAX_RESPONSE {
                response.truncate(EXIT_HTTP_MAX_RESPONSE);
                break;
            }
        }
        Some(response)
    };
    tokio::time::timeout(EXIT_HTTP_TIMEOUT, work).await.ok()?
}
