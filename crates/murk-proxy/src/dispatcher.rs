//! The dispatcher: the bridge between SOCKS sessions and the circuit
//! pool.
//!
//! One task owns the two routing maps and every decision that touches
//! them.  Outbound datagrams come in from the session readers; tunneled
//! payloads and circuit lifecycle events come in from the community; all
//! map mutations happen here, in arrival order, so the rest of the crate
//! can stay stateless.
//!
//! Routing is sticky: the first datagram for a (session, destination)
//! pair picks a circuit, and everything after it follows the same path
//! until the circuit or the session dies.  When nothing suitable is
//! ready, the first datagram triggers a build and waits on it, and any
//! datagrams the session sends meanwhile queue behind the same build, to
//! be dispatched in arrival order once it resolves.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use murk_cell::{addr_to_circuit_id, circuit_id_to_addr, CircId};
use murk_community::{CircuitEvent, Community, InboundData};
use murk_proto::{CircKind, CircState};
use murk_socks::UdpHeader;

/// How often sessions are checked for vanished connection tasks.
const CHECK_CONNECTIONS_INTERVAL: Duration = Duration::from_secs(30);

/// How many datagrams may queue behind one circuit build.
const PENDING_QUEUE_MAX: usize = 64;

/// An opaque handle for one SOCKS session.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a process-unique session id.
    pub(crate) fn fresh() -> SessionId {
        /// The next id to hand out.
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Keeps a session alive as far as the dispatcher is concerned.
///
/// The connection task holds the strong half; the dispatcher holds a
/// weak one.  If the task exits without saying goodbye, the weak half
/// goes dead and the periodic sweep evicts the session.
#[derive(Debug)]
pub(crate) struct SessionGuard;

/// What the listener and session tasks send the dispatcher.
#[derive(Debug)]
pub(crate) enum DispMsg {
    /// A UDP ASSOCIATE session came up.
    NewSession {
        /// Its id.
        id: SessionId,
        /// The hop count of the instance it arrived on.
        hops: u8,
        /// The relay socket datagrams flow back out of.
        udp: Arc<UdpSocket>,
        /// Liveness tie to the connection task.
        guard: Weak<SessionGuard>,
    },
    /// A session's control connection closed.
    SessionClosed {
        /// Which session.
        id: SessionId,
    },
    /// A datagram from a local client, already unwrapped and resolved.
    Datagram {
        /// The session it arrived on.
        id: SessionId,
        /// The client's UDP source address, for the return path.
        client: SocketAddr,
        /// Where the client wants it to go.
        dest: SocketAddr,
        /// The datagram bytes.
        payload: Vec<u8>,
    },
    /// A circuit build the dispatcher was waiting on resolved.
    BuildDone {
        /// The circuit that was building.
        circ: CircId,
        /// Whether it became ready.
        ok: bool,
    },
    /// Stop the dispatcher.
    Shutdown,
}

/// The dispatcher's two routing maps.
///
/// Free of I/O so the routing rules can be tested on their own.  The
/// maps are kept in lockstep: a circuit appears as a value in
/// `con_to_cir` exactly when it has an owner in `cid_to_con`.
#[derive(Debug, Default)]
struct DispatcherState {
    /// Destination to circuit, per session.
    con_to_cir: HashMap<SessionId, HashMap<SocketAddr, CircId>>,
    /// Which session owns each circuit's inbound traffic.
    cid_to_con: HashMap<CircId, SessionId>,
}

impl DispatcherState {
    /// The circuit already carrying (session, destination), if any.
    fn lookup(&self, session: SessionId, dest: SocketAddr) -> Option<CircId> {
        self.con_to_cir.get(&session)?.get(&dest).copied()
    }

    /// Record that `session` reaches `dest` via `circ`, claiming the
    /// circuit for the session.
    fn bind(&mut self, session: SessionId, dest: SocketAddr, circ: CircId) {
        self.con_to_cir
            .entry(session)
            .or_default()
            .insert(dest, circ);
        self.cid_to_con.insert(circ, session);
    }

    /// The session that owns `circ`, if any.
    fn owner(&self, circ: CircId) -> Option<SessionId> {
        self.cid_to_con.get(&circ).copied()
    }

    /// True if `session` may use `circ`: it is unowned or already its.
    fn claimable(&self, circ: CircId, session: SessionId) -> bool {
        match self.owner(circ) {
            None => true,
            Some(s) => s == session,
        }
    }

    /// A circuit `session` already owns, if any.  Stable under map
    /// reordering: the lowest id wins.
    fn owned_circuit(&self, session: SessionId) -> Option<CircId> {
        self.cid_to_con
            .iter()
            .filter(|(_, s)| **s == session)
            .map(|(c, _)| *c)
            .min()
    }

    /// Remove a dead circuit everywhere it is mentioned, returning the
    /// destinations that lose their mapping.  Idempotent.
    fn circuit_dead(&mut self, circ: CircId) -> Vec<SocketAddr> {
        let mut orphans = Vec::new();
        for by_dest in self.con_to_cir.values_mut() {
            by_dest.retain(|dest, c| {
                if *c == circ {
                    orphans.push(*dest);
                    false
                } else {
                    true
                }
            });
        }
        self.con_to_cir.retain(|_, m| !m.is_empty());
        self.cid_to_con.remove(&circ);
        orphans
    }

    /// Remove a dead session everywhere it is mentioned.
    fn session_dead(&mut self, session: SessionId) {
        self.con_to_cir.remove(&session);
        self.cid_to_con.retain(|_, s| *s != session);
    }
}

/// A live UDP ASSOCIATE session, as the dispatcher sees it.
#[derive(Debug)]
struct Session {
    /// The hop count of the instance it belongs to.
    hops: u8,
    /// The socket datagrams are relayed back out of.
    udp: Arc<UdpSocket>,
    /// Where the local client sends from, once first observed.
    client: Option<SocketAddr>,
    /// Liveness tie to the connection task.
    guard: Weak<SessionGuard>,
}

/// A circuit build in flight, with the datagrams parked behind it.
#[derive(Debug)]
struct PendingBuild {
    /// The session that asked for it.
    session: SessionId,
    /// Parked (destination, payload) pairs, in arrival order.
    queue: Vec<(SocketAddr, Vec<u8>)>,
}

/// The dispatcher task.
pub(crate) struct Dispatcher {
    /// Handle to the community reactor.
    community: Community,
    /// How many SOCKS instances exist; hop counts beyond this have no
    /// server and their traffic is refused.
    n_servers: usize,
    /// Our own message sender, for build watcher tasks.
    msgs_tx: mpsc::UnboundedSender<DispMsg>,
    /// Messages from listener and session tasks.
    msgs: mpsc::UnboundedReceiver<DispMsg>,
    /// Tunneled payloads arriving for local clients.
    inbound: mpsc::Receiver<InboundData>,
    /// Circuit lifecycle events.
    events: mpsc::UnboundedReceiver<CircuitEvent>,
    /// The routing maps.
    state: DispatcherState,
    /// Live sessions.
    sessions: HashMap<SessionId, Session>,
    /// Rendezvous circuits already checked as usable for sentinel sends.
    rp_ready: HashSet<CircId>,
    /// Builds in flight, keyed by the circuit being built.
    pending: HashMap<CircId, PendingBuild>,
    /// Which build each session is waiting on.
    session_builds: HashMap<SessionId, CircId>,
}

impl Dispatcher {
    /// Assemble a dispatcher.  It does nothing until [`run`](Self::run).
    pub(crate) fn new(
        community: Community,
        n_servers: usize,
        msgs_tx: mpsc::UnboundedSender<DispMsg>,
        msgs: mpsc::UnboundedReceiver<DispMsg>,
        inbound: mpsc::Receiver<InboundData>,
        events: mpsc::UnboundedReceiver<CircuitEvent>,
    ) -> Dispatcher {
        Dispatcher {
            community,
            n_servers,
            msgs_tx,
            msgs,
            inbound,
            events,
            state: DispatcherState::default(),
            sessions: HashMap::new(),
            rp_ready: HashSet::new(),
            pending: HashMap::new(),
            session_builds: HashMap::new(),
        }
    }

    /// Run until shutdown or until the community reactor goes away.
    pub(crate) async fn run(mut self) {
        let mut sweep = tokio::time::interval(CHECK_CONNECTIONS_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.msgs.recv() => match maybe {
                    Some(msg) => {
                        if !self.handle_msg(msg).await {
                            break;
                        }
                    }
                    None => break,
                },
                maybe = self.inbound.recv() => match maybe {
                    Some(data) => self.handle_inbound(data),
                    None => break,
                },
                maybe = self.events.recv() => match maybe {
                    Some(CircuitEvent::Closed { circ, .. }) => self.handle_circuit_closed(circ),
                    None => break,
                },
                _ = sweep.tick() => self.check_connections(),
            }
        }
        debug!("dispatcher exiting");
    }

    /// Handle one message from our own tasks.  Returns false on shutdown.
    async fn handle_msg(&mut self, msg: DispMsg) -> bool {
        match msg {
            DispMsg::NewSession {
                id,
                hops,
                udp,
                guard,
            } => {
                debug!(session = %id, hops, "socks session up");
                self.sessions.insert(
                    id,
                    Session {
                        hops,
                        udp,
                        client: None,
                        guard,
                    },
                );
            }
            DispMsg::SessionClosed { id } => self.session_dead(id),
            DispMsg::Datagram {
                id,
                client,
                dest,
                payload,
            } => self.on_socks_udp(id, client, dest, payload).await,
            DispMsg::BuildDone { circ, ok } => self.handle_build_done(circ, ok),
            DispMsg::Shutdown => return false,
        }
        true
    }

    /// Route one datagram from a local client into the tunnels.
    async fn on_socks_udp(
        &mut self,
        id: SessionId,
        client: SocketAddr,
        dest: SocketAddr,
        payload: Vec<u8>,
    ) {
        // Remember where the client talks from, for the return path.
        match self.sessions.get_mut(&id) {
            Some(session) => session.client = Some(client),
            None => {
                trace!(session = %id, "datagram for an unknown session");
                return;
            }
        }

        // Hidden-service traffic names its circuit in the address.
        if let Some(circ) = addr_to_circuit_id(&dest) {
            self.send_to_circuit_addr(id, circ, dest, payload).await;
            return;
        }

        if let Some(circ) = self.state.lookup(id, dest) {
            self.community.send_data(circ, dest, payload);
            return;
        }
        self.select_circuit(id, dest, payload).await;
    }

    /// Handle a datagram addressed to a circuit id.  Only a ready
    /// rendezvous circuit may be addressed this way; anything else is
    /// dropped.
    async fn send_to_circuit_addr(
        &mut self,
        id: SessionId,
        circ: CircId,
        dest: SocketAddr,
        payload: Vec<u8>,
    ) {
        if !self.rp_ready.contains(&circ) {
            let usable = match self.community.circuits().await {
                Ok(infos) => infos.iter().any(|c| {
                    c.id == circ
                        && c.state == CircState::Ready
                        && matches!(c.kind, CircKind::RpDownloader | CircKind::RpSeeder)
                }),
                Err(_) => false,
            };
            if !usable {
                trace!(circ = %circ, "datagram for a circuit that cannot take it");
                return;
            }
            self.rp_ready.insert(circ);
        }
        // Claim the circuit so replies find their way back to this
        // session.
        if self.state.claimable(circ, id) {
            self.state.bind(id, dest, circ);
        }
        self.community.send_data(circ, dest, payload);
    }

    /// Pick or build the circuit for a fresh (session, destination)
    /// pair, then send.
    async fn select_circuit(&mut self, id: SessionId, dest: SocketAddr, payload: Vec<u8>) {
        let Some(hops) = self.sessions.get(&id).map(|s| s.hops) else {
            return;
        };

        // Already waiting on a build: park behind it, in arrival order.
        if let Some(circ) = self.session_builds.get(&id) {
            if let Some(build) = self.pending.get_mut(circ) {
                if build.queue.len() < PENDING_QUEUE_MAX {
                    build.queue.push((dest, payload));
                } else {
                    trace!(session = %id, "build queue full; dropping datagram");
                }
                return;
            }
        }

        let snapshot = match self.community.circuits().await {
            Ok(s) => s,
            Err(_) => return,
        };
        let eligible: Vec<CircId> = snapshot
            .iter()
            .filter(|c| c.kind == CircKind::Data && c.state == CircState::Ready)
            .filter(|c| c.goal_hops == hops)
            .filter(|c| self.state.claimable(c.id, id))
            .map(|c| c.id)
            .collect();
        let picked = {
            let mut rng = rand::thread_rng();
            eligible.choose(&mut rng).copied()
        };
        if let Some(circ) = picked {
            self.state.bind(id, dest, circ);
            self.community.send_data(circ, dest, payload);
            return;
        }

        if self.state.owned_circuit(id).is_none() {
            // Nothing suitable and no circuit at all yet: build one and
            // park the datagram on it.
            match self.community.create_circuit(hops, CircKind::Data, None).await {
                Ok(pending) => {
                    let circ = pending.id;
                    debug!(session = %id, circ = %circ, hops, "building a circuit for a new session");
                    self.pending.insert(
                        circ,
                        PendingBuild {
                            session: id,
                            queue: vec![(dest, payload)],
                        },
                    );
                    self.session_builds.insert(id, circ);
                    let msgs = self.msgs_tx.clone();
                    tokio::spawn(async move {
                        let ok = pending.wait_ready().await.is_ok();
                        let _ = msgs.send(DispMsg::BuildDone { circ, ok });
                    });
                }
                Err(e) => {
                    debug!(session = %id, "cannot build a circuit: {}", e);
                }
            }
            return;
        }

        // The session has a circuit; this destination just has not used
        // it yet.
        if let Some(circ) = self.state.owned_circuit(id) {
            self.state.bind(id, dest, circ);
            self.community.send_data(circ, dest, payload);
        }
    }

    /// A build resolved; dispatch or drop what was parked behind it.
    fn handle_build_done(&mut self, circ: CircId, ok: bool) {
        let Some(build) = self.pending.remove(&circ) else {
            return;
        };
        self.session_builds.remove(&build.session);
        if !ok {
            debug!(circ = %circ, parked = build.queue.len(), "circuit build failed; dropping parked datagrams");
            return;
        }
        if !self.sessions.contains_key(&build.session) {
            // The session went away while we were building.
            return;
        }
        for (dest, payload) in build.queue {
            self.state.bind(build.session, dest, circ);
            self.community.send_data(circ, dest, payload);
        }
    }

    /// Deliver a tunneled payload to the right local client.
    fn handle_inbound(&mut self, data: InboundData) {
        let InboundData {
            circ,
            kind,
            hops,
            orig,
            payload,
        } = data;

        // The hop to a rendezvous point has no SOCKS instance of its
        // own; what the client asked for is one less.
        let session_hops = match kind {
            CircKind::Data => hops,
            CircKind::RpDownloader | CircKind::RpSeeder | CircKind::IpSeeder => {
                hops.saturating_sub(1)
            }
        };
        if session_hops == 0 || usize::from(session_hops) > self.n_servers {
            debug!(circ = %circ, hops = session_hops, "no socks server for this hop count; dropping");
            return;
        }

        // An anonymous origin is presented as the circuit's synthetic
        // address, so the client has somewhere to send replies.
        let orig = match kind {
            CircKind::RpDownloader | CircKind::RpSeeder => circuit_id_to_addr(circ),
            _ => orig,
        };

        let session = match self.state.owner(circ) {
            Some(s) if self.sessions.contains_key(&s) => s,
            _ => match self.attach(circ, session_hops, orig) {
                Some(s) => s,
                None => {
                    trace!(circ = %circ, "inbound payload with no session to take it");
                    return;
                }
            },
        };
        let Some(record) = self.sessions.get(&session) else {
            return;
        };
        let Some(client) = record.client else {
            trace!(session = %session, "client address not yet known; dropping");
            return;
        };

        let dgram = UdpHeader::for_reply(orig).encode(&payload);
        // The socket may not have been polled for writability yet, so a
        // synchronous try_send_to can spuriously refuse; send from a task.
        let udp = Arc::clone(&record.udp);
        tokio::spawn(async move {
            if let Err(e) = udp.send_to(&dgram, client).await {
                trace!(session = %session, "relay to client failed: {}", e);
            }
        });
    }

    /// Attach an unowned circuit to some session on the right instance.
    fn attach(&mut self, circ: CircId, hops: u8, orig: SocketAddr) -> Option<SessionId> {
        let id = self
            .sessions
            .iter()
            .filter(|(_, s)| s.hops == hops && s.client.is_some())
            .map(|(id, _)| *id)
            .min()?;
        debug!(circ = %circ, session = %id, "attaching inbound circuit to a session");
        self.state.bind(id, orig, circ);
        Some(id)
    }

    /// Forget a dead circuit everywhere.
    fn handle_circuit_closed(&mut self, circ: CircId) {
        self.rp_ready.remove(&circ);
        if let Some(build) = self.pending.remove(&circ) {
            self.session_builds.remove(&build.session);
        }
        let orphans = self.state.circuit_dead(circ);
        if !orphans.is_empty() {
            debug!(circ = %circ, orphans = orphans.len(), "circuit died; destinations unmapped");
        }
    }

    /// Forget a dead session everywhere.
    fn session_dead(&mut self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            debug!(session = %id, "socks session down");
        }
        if let Some(circ) = self.session_builds.remove(&id) {
            self.pending.remove(&circ);
        }
        self.state.session_dead(id);
    }

    /// Evict sessions whose connection task vanished without saying
    /// goodbye.
    fn check_connections(&mut self) {
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.guard.upgrade().is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            warn!(session = %id, "evicting a session whose task vanished");
            self.session_dead(id);
        }
    }
}
