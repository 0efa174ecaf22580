//! Reactor loop for one community endpoint.
//!
//! The reactor is spawned by [`launch`](crate::launch) and runs until it
//! is told to shut down or every control handle is gone.  It is the only
//! task with access to the overlay socket and the circuit, relay,
//! candidate, and payout tables, so every state change happens in one
//! place and in one order.
//!
//! Each pass of the loop waits for exactly one of:
//!
//! * a control message from a [`Community`](crate::Community) handle;
//! * a datagram on the overlay socket;
//! * a report from a spawned exit or HTTP task;
//! * the housekeeping tick.
//!
//! Circuits we own are built hop by hop here: each CREATE or EXTEND has
//! at most one answer outstanding per circuit, and a step that misses its
//! deadline fails the whole circuit.  Cells for circuits we merely carry
//! are handed to the relay half of this struct, which lives in
//! [`relay`](crate::relay).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use murk_cell::msg::{AnyMsg, Data, DestroyReason, Extend, HttpRequest, HttpResponse, Ping, Pong};
use murk_cell::{CellCmd, CircId, PeerDescriptor, PeerId, RawCell};
use murk_proto::handshake::{self, ClientHandshake};
use murk_proto::{CircKind, Circuit, CircuitInfo, TunnelKeypair};

use crate::candidates::CandidateSet;
use crate::exitcache::ExitCache;
use crate::payout::PayoutLedger;
use crate::relay::{LegKey, RelayState};
use crate::{
    CircuitEvent, CommunityConfig, Error, InboundData, PendingCircuit, RendEvent, Result,
};

/// Depth of the queue handing inbound payloads to the embedding code.
pub(crate) const INBOUND_QUEUE: usize = 128;
/// Depth of the queue carrying reports from spawned tasks back here.
const TASK_QUEUE: usize = 128;
/// How often the housekeeping pass runs.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Housekeeping passes between status log lines.
const STATUS_EVERY: u32 = 30;
/// Keepalives a circuit may leave unanswered before it is declared dead.
const MAX_UNANSWERED_PINGS: u8 = 3;
/// Outstanding probe nonces are forgotten after this long.
const PING_EXPIRY: Duration = Duration::from_secs(30);
/// Largest datagram the overlay socket will accept.
const MAX_DATAGRAM: usize = 65_535;

/// A message sent to the reactor from a [`Community`](crate::Community)
/// handle.
#[derive(Debug)]
pub(crate) enum CtrlMsg {
    /// Stop the reactor.
    Shutdown,
    /// Offer a peer descriptor as a candidate relay.
    AddCandidate {
        /// The descriptor on offer.
        desc: PeerDescriptor,
    },
    /// Start building a circuit.
    CreateCircuit {
        /// How many hops the finished circuit should have.
        goal_hops: u8,
        /// What the circuit will be used for.
        kind: CircKind,
        /// Pin the final hop to this peer, if given.
        terminal: Option<PeerDescriptor>,
        /// Where to send the pending circuit.
        tx: oneshot::Sender<Result<PendingCircuit>>,
    },
    /// Watch an existing circuit for readiness.
    WatchCircuit {
        /// Which circuit.
        circ: CircId,
        /// Where to send the watcher.
        tx: oneshot::Sender<Result<oneshot::Receiver<bool>>>,
    },
    /// Send a tunneled payload out a circuit.
    SendData {
        /// Which circuit.
        circ: CircId,
        /// Where the exit should forward the payload.
        dest: SocketAddr,
        /// The payload bytes.
        payload: Vec<u8>,
    },
    /// Send a protocol message to a circuit's terminal hop.
    SendMsg {
        /// Which circuit.
        circ: CircId,
        /// The message to seal and send.
        msg: AnyMsg,
    },
    /// Install the end-to-end rendezvous layer on a circuit.
    AppendE2e {
        /// Which circuit.
        circ: CircId,
        /// The agreed end-to-end keys.
        keys: murk_proto::HopKeys,
        /// Where to report completion.
        tx: oneshot::Sender<Result<()>>,
    },
    /// Tear down a circuit deliberately.
    RetireCircuit {
        /// Which circuit.
        circ: CircId,
        /// The reason to declare to its hops.
        reason: DestroyReason,
    },
    /// Snapshot every circuit we own.
    Circuits {
        /// Where to send the snapshot.
        tx: oneshot::Sender<Vec<CircuitInfo>>,
    },
    /// Snapshot the payout ledger.
    Payouts {
        /// Where to send the snapshot.
        tx: oneshot::Sender<Vec<(PeerId, u64)>>,
    },
    /// Snapshot every verified candidate's descriptor.
    Candidates {
        /// Where to send the snapshot.
        tx: oneshot::Sender<Vec<PeerDescriptor>>,
    },
    /// Run one tunneled TCP request/response exchange.
    HttpRequest {
        /// The circuit whose exit should run it.
        circ: CircId,
        /// The TCP endpoint to talk to.
        dest: SocketAddr,
        /// The request bytes.
        request: Vec<u8>,
        /// Where to send the response.
        tx: oneshot::Sender<Result<Vec<u8>>>,
    },
}

/// A report from a task the reactor spawned.
#[derive(Debug)]
pub(crate) enum TaskMsg {
    /// A datagram came back from the Internet on an exit socket.
    ExitInbound {
        /// The leg the exit socket belongs to.
        leg: LegKey,
        /// Who sent the datagram.
        orig: SocketAddr,
        /// The datagram bytes.
        payload: Vec<u8>,
    },
    /// A relayed TCP exchange finished.
    HttpDone {
        /// The leg the request arrived on.
        leg: LegKey,
        /// The request id it carried.
        request_id: u32,
        /// The response bytes; empty if the exchange failed.
        response: Vec<u8>,
    },
}

/// The channel endpoints the reactor talks over.
pub(crate) struct ReactorChannels {
    /// Control messages from `Community` handles.
    pub(crate) control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Queue of inbound tunneled payloads for the embedding code.
    pub(crate) inbound: mpsc::Sender<InboundData>,
    /// Circuit lifecycle events.
    pub(crate) events: mpsc::UnboundedSender<CircuitEvent>,
    /// Rendezvous-protocol signals.
    pub(crate) rend: mpsc::UnboundedSender<RendEvent>,
}

/// How the reactor loop exits.
#[derive(Debug)]
enum ReactorError {
    /// The reactor was asked to stop, or all handles are gone.
    Shutdown,
    /// The reactor hit an unrecoverable error.
    Err(Error),
}

impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}

/// Build progress for one of our circuits.
#[derive(Debug)]
pub(crate) struct BuildState {
    /// The handshake state and target of the step in flight, if any.
    pub(crate) outstanding: Option<(ClientHandshake, PeerDescriptor)>,
    /// The pinned final hop, if the caller chose one.
    pub(crate) terminal: Option<PeerDescriptor>,
    /// Whether the final hop must advertise the exit capability.
    pub(crate) need_exit: bool,
    /// When the step in flight fails the circuit.
    pub(crate) deadline: Instant,
}

/// What an outstanding ping nonce was testing.
#[derive(Debug)]
pub(crate) enum PingTarget {
    /// A link-level candidate probe.
    Candidate(SocketAddr),
    /// A circuit keepalive.
    Circuit(CircId),
}

/// One probe we have sent and not yet heard back from.
#[derive(Debug)]
pub(crate) struct PendingPing {
    /// What the probe was testing.
    pub(crate) target: PingTarget,
    /// When it went out.
    pub(crate) sent: Instant,
}

/// A tunneled TCP exchange awaiting its response.
#[derive(Debug)]
pub(crate) struct PendingHttp {
    /// The circuit it went out on.
    pub(crate) circ: CircId,
    /// Where to send the response.
    pub(crate) tx: oneshot::Sender<Result<Vec<u8>>>,
    /// When the requester gives up.
    pub(crate) deadline: Instant,
}

/// Build the one-byte DESTROY cell for a circuit.
pub(crate) fn destroy_cell(circ: CircId, reason: DestroyReason) -> RawCell {
    RawCell::new(Some(circ), CellCmd::DESTROY, vec![u8::from(reason)])
}

/// The state and logic of one community endpoint.
pub(crate) struct Reactor {
    /// Configuration, fixed at launch.
    pub(crate) config: CommunityConfig,
    /// Our long-term tunnel keypair.
    pub(crate) keypair: TunnelKeypair,
    /// Our own descriptor, as other peers see it.
    pub(crate) local: PeerDescriptor,
    /// The overlay socket; shared with exit reader tasks.
    pub(crate) socket: Arc<UdpSocket>,
    /// Control messages from `Community` handles.
    pub(crate) control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Queue of inbound tunneled payloads for the embedding code.
    pub(crate) inbound_tx: mpsc::Sender<InboundData>,
    /// Circuit lifecycle events.
    pub(crate) events_tx: mpsc::UnboundedSender<CircuitEvent>,
    /// Rendezvous-protocol signals.
    pub(crate) rend_tx: mpsc::UnboundedSender<RendEvent>,
    /// Every circuit we own, keyed by its id on our first-hop link.
    pub(crate) circuits: HashMap<CircId, Circuit>,
    /// Build progress for circuits that are not ready yet.
    pub(crate) building: HashMap<CircId, BuildState>,
    /// Peers we could use as hops.
    pub(crate) candidates: CandidateSet,
    /// Circuits we carry for other peers.
    pub(crate) relay: RelayState,
    /// Bytes relayed per peer, for payouts.
    pub(crate) payouts: PayoutLedger,
    /// Persisted exit descriptors for the next start.
    pub(crate) exit_cache: ExitCache,
    /// Probes awaiting their pong, by nonce.
    pub(crate) pings: HashMap<u64, PendingPing>,
    /// Tunneled TCP exchanges awaiting their response, by request id.
    pub(crate) pending_http: HashMap<u32, PendingHttp>,
    /// The next tunneled request id to hand out.
    pub(crate) next_request_id: u32,
    /// Sender cloned into spawned tasks.
    pub(crate) task_tx: mpsc::Sender<TaskMsg>,
    /// Reports from spawned tasks.
    pub(crate) from_tasks: mpsc::Receiver<TaskMsg>,
    /// Randomness for ids, nonces, hop picks, and handshakes.
    pub(crate) rng: StdRng,
    /// Housekeeping passes so far.
    pub(crate) ticks: u32,
}

impl Reactor {
    /// Assemble a reactor around a bound overlay socket.
    pub(crate) fn new(
        config: CommunityConfig,
        keypair: TunnelKeypair,
        socket: UdpSocket,
        local: PeerDescriptor,
        channels: ReactorChannels,
    ) -> Reactor {
        let (task_tx, from_tasks) = mpsc::channel(TASK_QUEUE);
        let exit_cache = ExitCache::open(config.state_dir.as_deref());
        let mut candidates = CandidateSet::new(local.id);
        let now = Instant::now();
        for desc in exit_cache.descriptors() {
            candidates.insert(desc, now);
        }
        Reactor {
            config,
            keypair,
            local,
            socket: Arc::new(socket),
            control: channels.control,
            inbound_tx: channels.inbound,
            events_tx: channels.events,
            rend_tx: channels.rend,
            circuits: HashMap::new(),
            building: HashMap::new(),
            candidates,
            relay: RelayState::default(),
            payouts: PayoutLedger::default(),
            exit_cache,
            pings: HashMap::new(),
            pending_http: HashMap::new(),
            next_request_id: 1,
            task_tx,
            from_tasks,
            rng: StdRng::from_entropy(),
            ticks: 0,
        }
    }

    /// Run the reactor until shutdown.
    pub(crate) async fn run(mut self) -> Result<()> {
        debug!(peer = %self.local.id, "community reactor running");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        let result = loop {
            match self.run_once(&mut ticker, &mut buf).await {
                Ok(()) => {}
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        self.cleanup().await;
        debug!(peer = %self.local.id, "community reactor stopped");
        result
    }

    /// Wait for and handle exactly one thing.
    async fn run_once(
        &mut self,
        ticker: &mut Interval,
        buf: &mut [u8],
    ) -> std::result::Result<(), ReactorError> {
        tokio::select! {
            ctrl = self.control.recv() => match ctrl {
                Some(msg) => self.handle_control(msg).await?,
                None => return Err(ReactorError::Shutdown),
            },
            received = self.socket.recv_from(buf) => match received {
                Ok((n, from)) => self.handle_datagram(from, &buf[..n]).await,
                Err(e) => debug!("overlay socket receive error: {}", e),
            },
            report = self.from_tasks.recv() => {
                if let Some(msg) = report {
                    self.handle_task_msg(msg).await;
                }
            }
            _ = ticker.tick() => self.tick(Instant::now()).await,
        }
        Ok(())
    }

    /// Handle one control message.
    async fn handle_control(&mut self, msg: CtrlMsg) -> std::result::Result<(), ReactorError> {
        match msg {
            CtrlMsg::Shutdown => return Err(ReactorError::Shutdown),
            CtrlMsg::AddCandidate { desc } => {
                let addr = desc.addr;
                if self.candidates.insert(desc, Instant::now()) {
                    self.probe_candidate(addr).await;
                }
            }
            CtrlMsg::CreateCircuit {
                goal_hops,
                kind,
                terminal,
                tx,
            } => {
                let result = self.begin_circuit(goal_hops, kind, terminal).await;
                let _ = tx.send(result);
            }
            CtrlMsg::WatchCircuit { circ, tx } => {
                let result = self
                    .circuits
                    .get_mut(&circ)
                    .map(Circuit::watch_ready)
                    .ok_or(Error::NoSuchCircuit);
                let _ = tx.send(result);
            }
            CtrlMsg::SendData {
                circ,
                dest,
                payload,
            } => self.handle_send_data(circ, dest, payload).await,
            CtrlMsg::SendMsg { circ, msg } => self.send_on_circuit(circ, msg).await,
            CtrlMsg::AppendE2e { circ, keys, tx } => {
                let result = match self.circuits.get_mut(&circ) {
                    Some(c) => c.add_end_to_end_layer(&keys).map_err(Error::from),
                    None => Err(Error::NoSuchCircuit),
                };
                let _ = tx.send(result);
            }
            CtrlMsg::RetireCircuit { circ, reason } => {
                self.remove_circuit(circ, reason, false, true).await;
            }
            CtrlMsg::Circuits { tx } => {
                let _ = tx.send(self.circuits.values().map(Circuit::info).collect());
            }
            CtrlMsg::Payouts { tx } => {
                let _ = tx.send(self.payouts.snapshot());
            }
            CtrlMsg::Candidates { tx } => {
                let verified = self
                    .candidates
                    .iter()
                    .filter(|c| c.verified)
                    .map(|c| c.desc.clone())
                    .collect();
                let _ = tx.send(verified);
            }
            CtrlMsg::HttpRequest {
                circ,
                dest,
                request,
                tx,
            } => self.handle_http_request(circ, dest, request, tx).await,
        }
        Ok(())
    }

    /// Handle a report from a spawned exit or HTTP task.
    async fn handle_task_msg(&mut self, msg: TaskMsg) {
        match msg {
            TaskMsg::ExitInbound { leg, orig, payload } => {
                self.handle_exit_inbound(leg, orig, payload).await;
            }
            TaskMsg::HttpDone {
                leg,
                request_id,
                response,
            } => self.handle_http_done(leg, request_id, response).await,
        }
    }

    /// Decode one datagram and route it to the right handler.
    async fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let cell = match RawCell::decode(datagram) {
            Ok(c) => c,
            Err(e) => {
                trace!(%from, "undecodable datagram: {}", e);
                return;
            }
        };
        self.candidates.note_activity(from, Instant::now());
        let Some(circ) = cell.circ() else {
            self.handle_link_cell(from, &cell).await;
            return;
        };
        match cell.cmd() {
            CellCmd::CREATE => self.handle_relay_create(from, circ, cell.payload()).await,
            CellCmd::CREATED => {
                if !self.handle_own_created(from, circ, cell.payload()).await
                    && !self.handle_relay_created(from, circ, cell.payload()).await
                {
                    trace!(%from, %circ, "CREATED for nothing we asked");
                }
            }
            CellCmd::DESTROY => {
                let reason = match AnyMsg::decode_payload(CellCmd::DESTROY, cell.payload()) {
                    Ok(AnyMsg::Destroy(d)) => d.reason,
                    _ => DestroyReason::NONE,
                };
                if !self.handle_own_destroy(from, circ, reason).await {
                    let _ = self.handle_relay_destroy(from, circ, reason).await;
                }
            }
            _ => {
                let key: LegKey = (from, circ);
                if self.is_own_circuit_cell(from, circ) {
                    self.handle_own_cell(circ, &cell).await;
                } else if self.relay.legs.contains_key(&key) {
                    self.relay_outbound(key, &cell).await;
                } else if let Some(in_leg) = self.relay.out_index.get(&key).copied() {
                    self.relay_inbound(in_leg, &cell).await;
                } else {
                    trace!(%from, %circ, cmd = %cell.cmd(), "cell for an unknown circuit");
                }
            }
        }
    }

    /// True if this cell belongs to a circuit we own and really comes
    /// from its first hop.
    fn is_own_circuit_cell(&self, from: SocketAddr, circ: CircId) -> bool {
        self.circuits
            .get(&circ)
            .and_then(Circuit::first_hop)
            .map(|h| h.peer.addr == from)
            .unwrap_or(false)
    }

    /// Handle a cell that carries no circuit id.
    async fn handle_link_cell(&mut self, from: SocketAddr, cell: &RawCell) {
        match AnyMsg::decode_payload(cell.cmd(), cell.payload()) {
            Ok(AnyMsg::Ping(Ping { nonce })) => {
                let Ok(reply) = AnyMsg::from(Pong { nonce }).into_cell(None) else {
                    return;
                };
                self.send_cell(from, reply).await;
            }
            Ok(AnyMsg::Pong(Pong { nonce })) => self.handle_link_pong(from, nonce),
            Ok(AnyMsg::Introduce1(intro)) => self.handle_introduce1(intro).await,
            Ok(other) => trace!(%from, cmd = %other.cmd(), "unexpected link-level message"),
            Err(e) => trace!(%from, "malformed link-level cell: {}", e),
        }
    }

    /// Handle a pong answering a candidate probe.
    fn handle_link_pong(&mut self, from: SocketAddr, nonce: u64) {
        match self.pings.remove(&nonce) {
            Some(PendingPing {
                target: PingTarget::Candidate(addr),
                ..
            }) if addr == from => {
                if let Some(id) = self.candidates.mark_verified(from, Instant::now()) {
                    if let Some(desc) = self.candidates.get(&id) {
                        let desc = desc.clone();
                        self.exit_cache.note_seen(&desc);
                    }
                }
            }
            Some(_) => trace!(%from, "pong does not match its probe"),
            None => trace!(%from, "unsolicited pong"),
        }
    }

    /// Start building a circuit and return a handle on its progress.
    async fn begin_circuit(
        &mut self,
        goal_hops: u8,
        kind: CircKind,
        terminal: Option<PeerDescriptor>,
    ) -> Result<PendingCircuit> {
        if goal_hops == 0 {
            return Err(Error::Internal("circuits need at least one hop"));
        }
        if self.building.len() >= self.config.max_concurrent_builds {
            return Err(Error::Busy);
        }
        let need_exit = matches!(kind, CircKind::Data) && terminal.is_none();
        let first = match (&terminal, goal_hops) {
            (Some(t), 1) => t.clone(),
            _ => {
                let mut exclude_ids = Vec::new();
                let mut exclude_ips = Vec::new();
                if let Some(t) = &terminal {
                    exclude_ids.push(t.id);
                    exclude_ips.push(t.addr.ip());
                }
                self.candidates
                    .pick_hop(
                        &mut self.rng,
                        &exclude_ids,
                        &exclude_ips,
                        need_exit && goal_hops == 1,
                    )
                    .ok_or(Error::NoCandidates)?
            }
        };
        let id = self.alloc_circ_id(first.addr);
        let mut circuit = Circuit::new(id, kind, goal_hops);
        let ready = circuit.watch_ready();
        let (state, client_msg) = handshake::client1(&mut self.rng, &first.tunnel_key);
        debug!(circ = %id, kind = %kind, goal = goal_hops, first = %first.id, "building circuit");
        self.send_cell(
            first.addr,
            RawCell::new(Some(id), CellCmd::CREATE, client_msg),
        )
        .await;
        self.circuits.insert(id, circuit);
        self.building.insert(
            id,
            BuildState {
                outstanding: Some((state, first)),
                terminal,
                need_exit,
                deadline: Instant::now() + self.config.extend_timeout,
            },
        );
        Ok(PendingCircuit { id, ready })
    }

    /// Accept a CREATED answering one of our own CREATEs.
    ///
    /// Returns false if no circuit of ours is waiting for it.
    async fn handle_own_created(&mut self, from: SocketAddr, circ: CircId, payload: &[u8]) -> bool {
        let awaited = self
            .building
            .get(&circ)
            .and_then(|b| b.outstanding.as_ref())
            .map(|(_, peer)| peer.addr == from)
            .unwrap_or(false);
        let first_step = self
            .circuits
            .get(&circ)
            .map(|c| c.hop_count() == 0)
            .unwrap_or(false);
        if !(awaited && first_step) {
            return false;
        }
        let reply = match AnyMsg::decode_payload(CellCmd::CREATED, payload) {
            Ok(AnyMsg::Created(c)) => c.handshake,
            _ => {
                debug!(circ = %circ, "malformed CREATED");
                self.remove_circuit(circ, DestroyReason::PROTOCOL, true, false)
                    .await;
                return true;
            }
        };
        let Some((state, peer)) = self
            .building
            .get_mut(&circ)
            .and_then(|b| b.outstanding.take())
        else {
            return false;
        };
        self.finish_hop(circ, state, peer, &reply).await;
        true
    }

    /// Accept an EXTENDED answering our outstanding extension.
    async fn handle_own_extended(&mut self, circ: CircId, reply: &[u8]) {
        let Some((state, peer)) = self
            .building
            .get_mut(&circ)
            .and_then(|b| b.outstanding.take())
        else {
            debug!(circ = %circ, "EXTENDED with no extension in flight");
            self.remove_circuit(circ, DestroyReason::PROTOCOL, true, true)
                .await;
            return;
        };
        self.finish_hop(circ, state, peer, reply).await;
    }

    /// Complete one hop handshake and move the build along.
    async fn finish_hop(
        &mut self,
        circ: CircId,
        state: ClientHandshake,
        peer: PeerDescriptor,
        reply: &[u8],
    ) {
        let keys = match handshake::client2(state, reply) {
            Ok(k) => k,
            Err(e) => {
                debug!(circ = %circ, hop = %peer.id, "hop handshake failed: {}", e);
                self.remove_circuit(circ, DestroyReason::PROTOCOL, true, true)
                    .await;
                return;
            }
        };
        let appended = self
            .circuits
            .get_mut(&circ)
            .map(|c| c.append_hop(peer, &keys));
        match appended {
            Some(Ok(())) => {
                trace!(circ = %circ, "hop established");
                self.advance_build(circ).await;
            }
            Some(Err(e)) => {
                debug!(circ = %circ, "could not append hop: {}", e);
                self.remove_circuit(circ, DestroyReason::INTERNAL, true, true)
                    .await;
            }
            None => {}
        }
    }

    /// Send the next EXTEND for a circuit under construction, or finish
    /// the build if it has all its hops.
    async fn advance_build(&mut self, circ: CircId) {
        let ready = self
            .circuits
            .get(&circ)
            .map(Circuit::is_ready)
            .unwrap_or(false);
        if ready {
            self.building.remove(&circ);
            debug!(circ = %circ, "circuit ready");
            return;
        }
        let picked = {
            let Some(c) = self.circuits.get(&circ) else {
                return;
            };
            let Some(b) = self.building.get(&circ) else {
                return;
            };
            let is_final = c.hop_count() + 1 == c.goal_hops();
            if is_final && b.terminal.is_some() {
                b.terminal.clone()
            } else {
                let mut exclude_ids: Vec<PeerId> = c.hops().iter().map(|h| h.peer.id).collect();
                let mut exclude_ips: Vec<IpAddr> =
                    c.hops().iter().map(|h| h.peer.addr.ip()).collect();
                if let Some(t) = &b.terminal {
                    exclude_ids.push(t.id);
                    exclude_ips.push(t.addr.ip());
                }
                let want_exit = is_final && b.need_exit;
                self.candidates
                    .pick_hop(&mut self.rng, &exclude_ids, &exclude_ips, want_exit)
            }
        };
        let Some(next) = picked else {
            debug!(circ = %circ, "no eligible candidate to extend with");
            self.remove_circuit(circ, DestroyReason::CONNECT_FAILED, true, true)
                .await;
            return;
        };
        let (state, client_msg) = handshake::client1(&mut self.rng, &next.tunnel_key);
        let body = AnyMsg::from(Extend {
            peer: next.clone(),
            handshake: client_msg,
        })
        .encode_payload();
        let Ok(body) = body else {
            self.remove_circuit(circ, DestroyReason::INTERNAL, true, true)
                .await;
            return;
        };
        let sealed = self.circuits.get_mut(&circ).map(|c| {
            let first = c.first_hop().map(|h| h.peer.addr);
            (first, c.encrypt_outbound(&body))
        });
        match sealed {
            Some((Some(first), Ok(wire))) => {
                trace!(circ = %circ, next = %next.id, "extending circuit");
                self.send_cell(first, RawCell::new(Some(circ), CellCmd::EXTEND, wire))
                    .await;
                if let Some(b) = self.building.get_mut(&circ) {
                    b.outstanding = Some((state, next));
                    b.deadline = Instant::now() + self.config.extend_timeout;
                }
            }
            Some((_, Err(e))) => {
                debug!(circ = %circ, "could not seal EXTEND: {}", e);
                self.remove_circuit(circ, DestroyReason::INTERNAL, true, true)
                    .await;
            }
            _ => {}
        }
    }

    /// Handle a DESTROY naming one of our own circuits.
    ///
    /// Only the circuit's first hop may close it; anyone else's DESTROY
    /// is left for the relay tables.  Returns false if it is not ours.
    async fn handle_own_destroy(
        &mut self,
        from: SocketAddr,
        circ: CircId,
        reason: DestroyReason,
    ) -> bool {
        let from_first_hop = self.is_own_circuit_cell(from, circ);
        let from_pending_create = !from_first_hop
            && self
                .circuits
                .get(&circ)
                .map(|c| c.hop_count() == 0)
                .unwrap_or(false)
            && self
                .building
                .get(&circ)
                .and_then(|b| b.outstanding.as_ref())
                .map(|(_, peer)| peer.addr == from)
                .unwrap_or(false);
        if !(from_first_hop || from_pending_create) {
            return false;
        }
        debug!(circ = %circ, reason = reason.human_str(), "circuit destroyed by peer");
        self.remove_circuit(circ, reason, true, false).await;
        true
    }

    /// Decrypt and interpret a cell from one of our circuits.
    async fn handle_own_cell(&mut self, circ: CircId, cell: &RawCell) {
        let plain = match self
            .circuits
            .get_mut(&circ)
            .map(|c| c.decrypt_inbound(cell.payload()))
        {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                debug!(circ = %circ, "undecryptable inbound cell: {}", e);
                self.remove_circuit(circ, DestroyReason::PROTOCOL, true, true)
                    .await;
                return;
            }
            None => return,
        };
        let msg = match AnyMsg::decode_payload(cell.cmd(), &plain) {
            Ok(m) => m,
            Err(e) => {
                debug!(circ = %circ, "malformed inbound message: {}", e);
                self.remove_circuit(circ, DestroyReason::PROTOCOL, true, true)
                    .await;
                return;
            }
        };
        match msg {
            AnyMsg::Extended(ex) => self.handle_own_extended(circ, &ex.handshake).await,
            AnyMsg::Data(d) => self.deliver_inbound(circ, d),
            AnyMsg::Pong(Pong { nonce }) => self.handle_circuit_pong(circ, nonce),
            AnyMsg::IntroEstablished(_) => {
                let _ = self.rend_tx.send(RendEvent::IntroEstablished { circ });
            }
            AnyMsg::RendezvousEstablished(_) => {
                let _ = self.rend_tx.send(RendEvent::RendezvousEstablished { circ });
            }
            AnyMsg::Introduce2(intro) => {
                let _ = self.rend_tx.send(RendEvent::Introduction {
                    circ,
                    service: intro.service,
                    sealed: intro.sealed,
                });
            }
            AnyMsg::Rendezvous2(r2) => {
                let _ = self.rend_tx.send(RendEvent::RendezvousCompleted {
                    circ,
                    handshake: r2.handshake,
                });
            }
            AnyMsg::HttpResponse(hr) => self.handle_http_response(circ, hr),
            other => {
                debug!(circ = %circ, cmd = %other.cmd(), "unexpected message on our circuit");
                self.remove_circuit(circ, DestroyReason::PROTOCOL, true, true)
                    .await;
            }
        }
    }

    /// Queue an inbound tunneled payload for the embedding code.
    ///
    /// The queue is bounded; when it is full the payload is dropped, the
    /// same fate an overflowing UDP socket would give it.
    fn deliver_inbound(&mut self, circ: CircId, d: Data) {
        let Some(c) = self.circuits.get(&circ) else {
            return;
        };
        let item = InboundData {
            circ,
            kind: c.kind(),
            hops: c.goal_hops(),
            orig: d.orig,
            payload: d.payload,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inbound_tx.try_send(item) {
            trace!(circ = %circ, "inbound queue full; dropping payload");
        }
    }

    /// Handle a pong answering a circuit keepalive.
    fn handle_circuit_pong(&mut self, circ: CircId, nonce: u64) {
        match self.pings.remove(&nonce) {
            Some(PendingPing {
                target: PingTarget::Circuit(c),
                sent,
            }) if c == circ => {
                let rtt = sent.elapsed();
                if let Some(circuit) = self.circuits.get_mut(&circ) {
                    circuit.note_pong(rtt);
                }
                trace!(circ = %circ, ?rtt, "keepalive answered");
            }
            Some(_) => trace!(circ = %circ, "pong does not match its probe"),
            None => trace!(circ = %circ, "unsolicited pong"),
        }
    }

    /// Handle the answer to a tunneled TCP exchange.
    fn handle_http_response(&mut self, circ: CircId, hr: HttpResponse) {
        let expected = self
            .pending_http
            .get(&hr.request_id)
            .map(|p| p.circ == circ)
            .unwrap_or(false);
        if !expected {
            trace!(circ = %circ, "tunneled response nobody is waiting for");
            return;
        }
        if let Some(p) = self.pending_http.remove(&hr.request_id) {
            let _ = p.tx.send(Ok(hr.response));
        }
    }

    /// Send a tunneled payload out a circuit, if it is usable.
    async fn handle_send_data(&mut self, circ: CircId, dest: SocketAddr, payload: Vec<u8>) {
        let Some(c) = self.circuits.get(&circ) else {
            trace!(circ = %circ, "payload for an unknown circuit; dropping");
            return;
        };
        if !c.is_ready() {
            trace!(circ = %circ, "payload for a circuit that is not ready; dropping");
            return;
        }
        // Rendezvous traffic needs no exit addressing; the spliced far
        // side is the destination.
        let dest = match c.kind() {
            CircKind::Data => dest,
            _ => Data::unset_addr(),
        };
        let body = Data {
            dest,
            orig: Data::unset_addr(),
            payload,
        };
        self.send_on_circuit(circ, AnyMsg::from(body)).await;
    }

    /// Seal a message under a circuit's layers and send it out.
    async fn send_on_circuit(&mut self, circ: CircId, msg: AnyMsg) {
        let cmd = msg.cmd();
        let Ok(plain) = msg.encode_payload() else {
            debug!(circ = %circ, "unencodable message");
            return;
        };
        let sealed = self.circuits.get_mut(&circ).map(|c| {
            let first = c.first_hop().map(|h| h.peer.addr);
            (first, c.encrypt_outbound(&plain))
        });
        match sealed {
            Some((Some(first), Ok(wire))) => {
                self.send_cell(first, RawCell::new(Some(circ), cmd, wire))
                    .await;
            }
            Some((_, Err(e))) => {
                debug!(circ = %circ, "could not seal outbound message: {}", e);
                self.remove_circuit(circ, DestroyReason::INTERNAL, true, true)
                    .await;
            }
            Some((None, _)) => {}
            None => trace!(circ = %circ, "message for an unknown circuit; dropping"),
        }
    }

    /// Start one tunneled TCP exchange and remember who is waiting.
    async fn handle_http_request(
        &mut self,
        circ: CircId,
        dest: SocketAddr,
        request: Vec<u8>,
        tx: oneshot::Sender<Result<Vec<u8>>>,
    ) {
        let ready = self
            .circuits
            .get(&circ)
            .map(Circuit::is_ready)
            .unwrap_or(false);
        if !ready {
            let _ = tx.send(Err(Error::NoSuchCircuit));
            return;
        }
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.pending_http.insert(
            request_id,
            PendingHttp {
                circ,
                tx,
                deadline: Instant::now() + self.config.http_timeout,
            },
        );
        trace!(circ = %circ, request_id, %dest, "sending tunneled request");
        let body = HttpRequest {
            request_id,
            dest,
            request,
        };
        self.send_on_circuit(circ, AnyMsg::from(body)).await;
    }

    /// Close one of our circuits, credit its hops, and tell whoever was
    /// waiting on it.
    pub(crate) async fn remove_circuit(
        &mut self,
        circ: CircId,
        reason: DestroyReason,
        broken: bool,
        notify_first_hop: bool,
    ) {
        let Some(mut circuit) = self.circuits.remove(&circ) else {
            return;
        };
        self.building.remove(&circ);
        let first = circuit.first_hop().map(|h| h.peer.addr);
        if broken {
            circuit.mark_broken();
        } else {
            circuit.begin_close();
        }
        self.payouts.credit_circuit(&circuit);
        let _ = self.events_tx.send(CircuitEvent::Closed {
            circ,
            kind: circuit.kind(),
        });
        let stale: Vec<u32> = self
            .pending_http
            .iter()
            .filter(|(_, p)| p.circ == circ)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(p) = self.pending_http.remove(&id) {
                let _ = p.tx.send(Err(Error::CircuitFailed));
            }
        }
        if notify_first_hop {
            if let Some(addr) = first {
                self.send_cell(addr, destroy_cell(circ, reason)).await;
            }
        }
        debug!(circ = %circ, reason = reason.human_str(), "circuit closed");
    }

    /// Send a link-level ping to a candidate.
    async fn probe_candidate(&mut self, addr: SocketAddr) {
        let nonce: u64 = self.rng.gen();
        self.pings.insert(
            nonce,
            PendingPing {
                target: PingTarget::Candidate(addr),
                sent: Instant::now(),
            },
        );
        let Ok(cell) = AnyMsg::from(Ping { nonce }).into_cell(None) else {
            return;
        };
        trace!(%addr, "probing candidate");
        self.send_cell(addr, cell).await;
    }

    /// The housekeeping pass: deadlines, keepalives, expiry, the pool.
    pub(crate) async fn tick(&mut self, now: Instant) {
        self.ticks = self.ticks.wrapping_add(1);

        let overdue: Vec<CircId> = self
            .building
            .iter()
            .filter(|(_, b)| now >= b.deadline)
            .map(|(id, _)| *id)
            .collect();
        for circ in overdue {
            debug!(circ = %circ, "circuit build step timed out");
            self.remove_circuit(circ, DestroyReason::TIMEOUT, true, true)
                .await;
        }

        let aged: Vec<CircId> = self
            .circuits
            .values()
            .filter(|c| c.is_ready() && c.age() >= self.config.max_circuit_age)
            .map(Circuit::id)
            .collect();
        for circ in aged {
            debug!(circ = %circ, "circuit aged out");
            self.remove_circuit(circ, DestroyReason::FINISHED, false, true)
                .await;
        }

        let idle: Vec<CircId> = self
            .circuits
            .values()
            .filter(|c| c.is_ready() && c.idle_for() >= self.config.keepalive_interval)
            .map(Circuit::id)
            .collect();
        for circ in idle {
            let unanswered = self
                .circuits
                .get_mut(&circ)
                .map(|c| c.note_ping_sent())
                .unwrap_or(0);
            if unanswered > MAX_UNANSWERED_PINGS {
                debug!(circ = %circ, "circuit stopped answering keepalives");
                self.remove_circuit(circ, DestroyReason::TIMEOUT, true, true)
                    .await;
                continue;
            }
            let nonce: u64 = self.rng.gen();
            self.pings.insert(
                nonce,
                PendingPing {
                    target: PingTarget::Circuit(circ),
                    sent: now,
                },
            );
            self.send_on_circuit(circ, AnyMsg::from(Ping { nonce })).await;
        }

        self.pings
            .retain(|_, p| now.duration_since(p.sent) < PING_EXPIRY);

        let due = self.candidates.due_for_probe(
            now,
            self.config.keepalive_interval,
            self.config.candidate_expiry,
        );
        for addr in due {
            self.probe_candidate(addr).await;
        }
        self.candidates.expire(now, self.config.candidate_expiry);

        self.tick_relay(now).await;

        let expired: Vec<u32> = self
            .pending_http
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending_http.remove(&id) {
                let _ = p.tx.send(Err(Error::RequestTimeout));
            }
        }

        self.maintain_pool().await;

        if self.ticks % STATUS_EVERY == 0 {
            self.log_status();
        }
        self.exit_cache.flush_if_dirty();
    }

    /// Keep the data-circuit pool at its configured size for every hop
    /// count: top it up when short, retire the oldest when over.
    pub(crate) async fn maintain_pool(&mut self) {
        let hop_counts = self.config.hop_counts.clone();
        for goal in hop_counts {
            if goal == 0 {
                continue;
            }
            let live = self
                .circuits
                .values()
                .filter(|c| {
                    matches!(c.kind(), CircKind::Data) && c.goal_hops() == goal && c.is_live()
                })
                .count();
            if live < self.config.min_circuits
                && self.building.len() < self.config.max_concurrent_builds
                && self.candidates.n_verified() > 0
            {
                match self.begin_circuit(goal, CircKind::Data, None).await {
                    Ok(_pending) => {}
                    Err(Error::NoCandidates | Error::Busy) => {}
                    Err(e) => debug!(goal, "pool build failed: {}", e),
                }
            }

            let mut ready: Vec<(CircId, Duration)> = self
                .circuits
                .values()
                .filter(|c| {
                    matches!(c.kind(), CircKind::Data) && c.goal_hops() == goal && c.is_ready()
                })
                .map(|c| (c.id(), c.age()))
                .collect();
            if ready.len() > self.config.max_circuits {
                ready.sort_by(|a, b| b.1.cmp(&a.1));
                let excess = ready.len() - self.config.max_circuits;
                for (circ, _) in ready.into_iter().take(excess) {
                    debug!(circ = %circ, goal, "retiring surplus circuit");
                    self.remove_circuit(circ, DestroyReason::FINISHED, false, true)
                        .await;
                }
            }
        }
    }

    /// One line of operational state, logged every half minute.
    fn log_status(&self) {
        let ready = self.circuits.values().filter(|c| c.is_ready()).count();
        info!(
            circuits = self.circuits.len(),
            ready,
            building = self.building.len(),
            candidates = self.candidates.len(),
            verified = self.candidates.n_verified(),
            relayed_legs = self.relay.legs.len(),
            "community status",
        );
    }

    /// Pick a circuit id that is unused locally for this peer's link.
    pub(crate) fn alloc_circ_id(&mut self, peer: SocketAddr) -> CircId {
        loop {
            let Some(id) = CircId::new(self.rng.gen()) else {
                continue;
            };
            let key: LegKey = (peer, id);
            if self.circuits.contains_key(&id)
                || self.building.contains_key(&id)
                || self.relay.legs.contains_key(&key)
                || self.relay.out_index.contains_key(&key)
                || self.relay.pending_extends.contains_key(&key)
            {
                continue;
            }
            return id;
        }
    }

    /// Encode and send one cell.  Transport errors are logged and
    /// swallowed; UDP promises nothing anyway.
    pub(crate) async fn send_cell(&self, to: SocketAddr, cell: RawCell) {
        let bytes = cell.encode();
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            trace!(%to, "overlay send failed: {}", e);
        }
    }

    /// Tear everything down on the way out.
    async fn cleanup(&mut self) {
        let own: Vec<CircId> = self.circuits.keys().copied().collect();
        for circ in own {
            self.remove_circuit(circ, DestroyReason::REQUESTED, false, true)
                .await;
        }
        let legs: Vec<LegKey> = self.relay.legs.keys().copied().collect();
        for leg in legs {
            self.teardown_leg(leg, DestroyReason::REQUESTED, true, true)
                .await;
        }
        self.exit_cache.flush_if_dirty();
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use murk_cell::PeerFlags;
    use murk_proto::HopKeys;

    async fn test_reactor(
        config: CommunityConfig,
    ) -> (Reactor, mpsc::UnboundedReceiver<CircuitEvent>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let keypair = TunnelKeypair::generate(&mut rand::thread_rng());
        let local = PeerDescriptor {
            id: keypair.peer_id(),
            addr: socket.local_addr().unwrap(),
            tunnel_key: keypair.public_bytes(),
            flags: PeerFlags::RELAY,
        };
        let (_ctrl_tx, control) = mpsc::unbounded_channel();
        let (inbound, _inbound_rx) = mpsc::channel(8);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (rend, _rend_rx) = mpsc::unbounded_channel();
        let channels = ReactorChannels {
            control,
            inbound,
            events,
            rend,
        };
        (
            Reactor::new(config, keypair, socket, local, channels),
            events_rx,
        )
    }

    fn test_descriptor(addr: &str) -> PeerDescriptor {
        let kp = TunnelKeypair::generate(&mut rand::thread_rng());
        PeerDescriptor {
            id: kp.peer_id(),
            addr: addr.parse().unwrap(),
            tunnel_key: kp.public_bytes(),
            flags: PeerFlags::RELAY | PeerFlags::EXIT_BT,
        }
    }

    #[tokio::test]
    async fn create_with_no_candidates_is_refused() {
        let (mut r, _events) = test_reactor(CommunityConfig::default()).await;
        let result = r.begin_circuit(2, CircKind::Data, None).await;
        assert!(matches!(result, Err(Error::NoCandidates)));
        assert!(r.circuits.is_empty());
    }

    #[tokio::test]
    async fn concurrent_builds_are_bounded() {
        let config = CommunityConfig {
            max_concurrent_builds: 1,
            ..Default::default()
        };
        let (mut r, _events) = test_reactor(config).await;
        let now = Instant::now();
        for addr in ["127.0.0.1:19001", "127.0.0.1:19002"] {
            let d = test_descriptor(addr);
            r.candidates.insert(d.clone(), now);
            r.candidates.mark_verified(d.addr, now);
        }

        assert!(r.begin_circuit(2, CircKind::Data, None).await.is_ok());
        let second = r.begin_circuit(2, CircKind::Data, None).await;
        assert!(matches!(second, Err(Error::Busy)));
    }

    #[tokio::test]
    async fn build_timeout_breaks_the_circuit() {
        let config = CommunityConfig {
            extend_timeout: Duration::from_millis(1),
            min_circuits: 0,
            ..Default::default()
        };
        let (mut r, mut events) = test_reactor(config).await;
        let now = Instant::now();
        let hop = test_descriptor("127.0.0.1:19011");
        r.candidates.insert(hop.clone(), now);
        r.candidates.mark_verified(hop.addr, now);

        let pending = r.begin_circuit(1, CircKind::Data, None).await.unwrap();
        let id = pending.id;
        tokio::time::sleep(Duration::from_millis(5)).await;
        r.tick(Instant::now()).await;

        assert!(!r.circuits.contains_key(&id));
        assert!(matches!(
            pending.wait_ready().await,
            Err(Error::CircuitFailed)
        ));
        match events.try_recv() {
            Ok(CircuitEvent::Closed { circ, .. }) => assert_eq!(circ, id),
            other => panic!("expected a closed event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn surplus_circuits_are_retired_oldest_first() {
        let config = CommunityConfig {
            min_circuits: 0,
            max_circuits: 1,
            ..Default::default()
        };
        let (mut r, mut events) = test_reactor(config).await;
        let hop = test_descriptor("127.0.0.1:19021");
        let keys = HopKeys::new([7; 32], [8; 32]);

        let id_old = CircId::new(101).unwrap();
        let mut older = Circuit::new(id_old, CircKind::Data, 1);
        older.append_hop(hop.clone(), &keys).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let id_new = CircId::new(102).unwrap();
        let mut newer = Circuit::new(id_new, CircKind::Data, 1);
        newer.append_hop(hop.clone(), &keys).unwrap();
        r.circuits.insert(id_old, older);
        r.circuits.insert(id_new, newer);

        r.maintain_pool().await;

        assert!(!r.circuits.contains_key(&id_old));
        assert!(r.circuits.contains_key(&id_new));
        match events.try_recv() {
            Ok(CircuitEvent::Closed { circ, .. }) => assert_eq!(circ, id_old),
            other => panic!("expected a closed event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn destroy_is_only_honored_from_the_first_hop() {
        let config = CommunityConfig {
            min_circuits: 0,
            ..Default::default()
        };
        let (mut r, mut events) = test_reactor(config).await;
        let hop = test_descriptor("127.0.0.1:19031");
        let keys = HopKeys::new([1; 32], [2; 32]);
        let id = CircId::new(500).unwrap();
        let mut c = Circuit::new(id, CircKind::Data, 1);
        c.append_hop(hop.clone(), &keys).unwrap();
        r.circuits.insert(id, c);

        let stranger: SocketAddr = "127.0.0.9:4444".parse().unwrap();
        assert!(!r.handle_own_destroy(stranger, id, DestroyReason::NONE).await);
        assert!(r.circuits.contains_key(&id));

        assert!(
            r.handle_own_destroy(hop.addr, id, DestroyReason::FINISHED)
                .await
        );
        assert!(!r.circuits.contains_key(&id));
        assert!(matches!(
            events.try_recv(),
            Ok(CircuitEvent::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn closing_a_circuit_credits_its_hops() {
        let config = CommunityConfig {
            min_circuits: 0,
            ..Default::default()
        };
        let (mut r, _events) = test_reactor(config).await;
        let hop = test_descriptor("127.0.0.1:19051");
        let keys = HopKeys::new([3; 32], [4; 32]);
        let id = CircId::new(900).unwrap();
        let mut c = Circuit::new(id, CircKind::Data, 1);
        c.append_hop(hop.clone(), &keys).unwrap();
        c.encrypt_outbound(b"some tunneled payload").unwrap();
        r.circuits.insert(id, c);

        r.remove_circuit(id, DestroyReason::FINISHED, false, true)
            .await;

        let totals = r.payouts.snapshot();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].0, hop.id);
        assert!(totals[0].1 > 0);
    }

    #[tokio::test]
    async fn circuit_ids_never_collide_locally() {
        let (mut r, _events) = test_reactor(CommunityConfig::default()).await;
        let peer: SocketAddr = "127.0.0.1:19041".parse().unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let id = r.alloc_circ_id(peer);
            assert!(seen.insert(id));
            r.relay.out_index.insert((peer, id), (peer, id));
        }
    }
}
