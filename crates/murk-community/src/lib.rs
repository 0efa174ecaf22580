//! One peer's membership in the murk overlay: the circuits it owns, the
//! traffic it relays for others, and the bookkeeping that keeps both
//! healthy.
//!
//! # Overview
//!
//! All overlay traffic runs over a single UDP socket, one cell per
//! datagram.  A background **reactor** task owns that socket and every
//! piece of mutable state behind it: the circuits we have built, the legs
//! we relay for other peers, the candidate table, the payout ledger.
//! Nothing else touches those maps, so there are no locks to take and no
//! ordering to get wrong; everyone else talks to the reactor through a
//! [`Community`] handle and message channels.
//!
//! The reactor's jobs:
//!
//! * build circuits hop by hop (CREATE/EXTEND), keep a pool of ready
//!   data circuits at each configured length, and retire the old ones;
//! * relay cells for circuits owned by other peers, including acting as
//!   an exit, an introduction point, or a rendezvous point when asked;
//! * verify candidate relays with liveness probes and expire the ones
//!   that stop answering;
//! * account the bytes relayed through each peer so they can be paid.
//!
//! Tunneled payloads arriving for us are handed off on a bounded queue as
//! [`InboundData`]; circuit lifecycle changes and rendezvous signals
//! arrive as [`CircuitEvent`] and [`RendEvent`] streams.  The SOCKS
//! dispatcher and the rendezvous drivers live in other crates and consume
//! those.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error};

use murk_cell::msg::{AnyMsg, DestroyReason};
use murk_cell::{CircId, PeerDescriptor, PeerFlags, ServiceId};
use murk_proto::{CircKind, CircuitInfo, TunnelKeypair};

mod candidates;
mod exitcache;
mod payout;
mod reactor;
mod relay;

use reactor::{CtrlMsg, Reactor, ReactorChannels};

/// An error produced while talking to (or inside) the community reactor.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The overlay socket could not be bound.
    #[error("Unable to bind overlay socket on {addr}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        err: Arc<std::io::Error>,
    },

    /// The reactor has shut down; no operations are possible.
    #[error("Community has shut down")]
    Shutdown,

    /// The operation named a circuit we do not have.
    #[error("No such circuit")]
    NoSuchCircuit,

    /// There were not enough verified candidates to build the circuit.
    #[error("Not enough verified candidates")]
    NoCandidates,

    /// Too many circuit builds are already in flight.
    #[error("Too many circuit builds in flight")]
    Busy,

    /// The circuit broke before the operation finished.
    #[error("Circuit failed")]
    CircuitFailed,

    /// A tunneled request got no answer in time.
    #[error("Tunneled request timed out")]
    RequestTimeout,

    /// A circuit cryptography operation failed.
    #[error("Circuit cryptography error")]
    Proto(#[from] murk_proto::Error),

    /// Something went wrong inside the reactor.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl From<oneshot::Canceled> for Error {
    fn from(_: oneshot::Canceled) -> Error {
        Error::Shutdown
    }
}

/// A Result type for this crate's functions.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for one community endpoint.
///
/// Everything here has a workable default except `listen_addr`, which
/// most callers will want to set.
#[derive(Clone, Debug)]
pub struct CommunityConfig {
    /// Address to bind the overlay UDP socket on.
    pub listen_addr: SocketAddr,
    /// Hop counts the pool keeps data circuits ready for.
    pub hop_counts: Vec<u8>,
    /// Minimum live (ready or building) data circuits per hop count.
    pub min_circuits: usize,
    /// Maximum data circuits per hop count; the oldest beyond this are
    /// retired.
    pub max_circuits: usize,
    /// Maximum circuit builds allowed in flight at once.
    pub max_concurrent_builds: usize,
    /// How long one CREATE or EXTEND step may take before the circuit is
    /// abandoned.
    pub extend_timeout: Duration,
    /// Retire circuits once they reach this age.
    pub max_circuit_age: Duration,
    /// Probe idle circuits and unverified candidates this often.
    pub keepalive_interval: Duration,
    /// Forget candidates that have not answered a probe for this long.
    pub candidate_expiry: Duration,
    /// Answer tunneled HTTP requests within this long, or give up.
    pub http_timeout: Duration,
    /// Whether we relay circuit traffic for other peers.
    pub relay_enabled: bool,
    /// Whether we exit BitTorrent traffic to the Internet for other
    /// peers.
    pub exit_enabled: bool,
    /// Directory for persisted state (the exit descriptor cache); `None`
    /// disables persistence.
    pub state_dir: Option<PathBuf>,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        CommunityConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            hop_counts: vec![1, 2, 3],
            min_circuits: 2,
            max_circuits: 6,
            max_concurrent_builds: 4,
            extend_timeout: Duration::from_secs(10),
            max_circuit_age: Duration::from_secs(30 * 60),
            keepalive_interval: Duration::from_secs(15),
            candidate_expiry: Duration::from_secs(10 * 60),
            http_timeout: Duration::from_secs(20),
            relay_enabled: true,
            exit_enabled: false,
            state_dir: None,
        }
    }
}

/// A tunneled payload that arrived on one of our circuits.
#[derive(Clone, Debug)]
pub struct InboundData {
    /// The circuit it arrived on.
    pub circ: CircId,
    /// That circuit's kind.
    pub kind: CircKind,
    /// That circuit's hop count.
    pub hops: u8,
    /// Where the payload came from, as the sender declared it.  Payloads
    /// arriving over a rendezvous circuit carry an unset origin; the
    /// receiving end decides how to address replies.
    pub orig: SocketAddr,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

/// A change in the life of one of our circuits.
#[derive(Clone, Debug)]
pub enum CircuitEvent {
    /// The circuit is gone: broken, expired, or deliberately closed.
    Closed {
        /// Which circuit.
        circ: CircId,
        /// What kind of circuit it was.
        kind: CircKind,
    },
}

/// A rendezvous-protocol signal that arrived on one of our circuits.
#[derive(Clone, Debug)]
pub enum RendEvent {
    /// The terminal hop agreed to act as our introduction point.
    IntroEstablished {
        /// The circuit whose terminal hop answered.
        circ: CircId,
    },
    /// The terminal hop agreed to act as our rendezvous point.
    RendezvousEstablished {
        /// The circuit whose terminal hop answered.
        circ: CircId,
    },
    /// An introduction point relayed a downloader's introduction to us.
    Introduction {
        /// The circuit it arrived on (one of our intro circuits).
        circ: CircId,
        /// The service the introduction is for.
        service: ServiceId,
        /// The sealed part, openable only with the service keypair.
        sealed: Vec<u8>,
    },
    /// The rendezvous point forwarded the seeder's half of the
    /// end-to-end handshake.
    RendezvousCompleted {
        /// The circuit it arrived on (our rendezvous circuit).
        circ: CircId,
        /// The seeder's handshake message.
        handshake: Vec<u8>,
    },
}

/// A circuit that has been started but may not be ready yet.
#[derive(Debug)]
pub struct PendingCircuit {
    /// The new circuit's id.
    pub id: CircId,
    /// Resolves `true` when the circuit is ready, `false` when it has
    /// failed instead.
    pub ready: oneshot::Receiver<bool>,
}

impl PendingCircuit {
    /// Wait for the circuit to finish building.
    ///
    /// Returns the circuit id on success and [`Error::CircuitFailed`] if
    /// the build failed.
    pub async fn wait_ready(self) -> Result<CircId> {
        match self.ready.await {
            Ok(true) => Ok(self.id),
            Ok(false) => Err(Error::CircuitFailed),
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// Everything [`launch`] hands back: the handle plus the streams the
/// reactor feeds.
pub struct CommunityHandles {
    /// Handle for talking to the reactor.
    pub community: Community,
    /// Tunneled payloads arriving for us.  Bounded; overflow is dropped,
    /// as datagrams are.
    pub inbound: mpsc::Receiver<InboundData>,
    /// Circuit lifecycle events.
    pub circuit_events: mpsc::UnboundedReceiver<CircuitEvent>,
    /// Rendezvous-protocol signals.
    pub rend_events: mpsc::UnboundedReceiver<RendEvent>,
}

/// Bind the overlay socket and start the community reactor.
///
/// The reactor task runs until [`Community::shutdown`] is called or every
/// handle is dropped.
pub async fn launch(config: CommunityConfig, keypair: TunnelKeypair) -> Result<CommunityHandles> {
    let socket = UdpSocket::bind(config.listen_addr)
        .await
        .map_err(|e| Error::Bind {
            addr: config.listen_addr,
            err: Arc::new(e),
        })?;
    let local_addr = socket.local_addr().map_err(|e| Error::Bind {
        addr: config.listen_addr,
        err: Arc::new(e),
    })?;

    let mut flags = PeerFlags::default();
    if config.relay_enabled {
        flags = flags | PeerFlags::RELAY;
    }
    if config.exit_enabled {
        flags = flags | PeerFlags::EXIT_BT;
    }
    let local = PeerDescriptor {
        id: keypair.peer_id(),
        addr: local_addr,
        tunnel_key: keypair.public_bytes(),
        flags,
    };
    debug!(peer = %local.id, addr = %local_addr, "overlay socket bound");

    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(reactor::INBOUND_QUEUE);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (rend_tx, rend_rx) = mpsc::unbounded_channel();

    let channels = ReactorChannels {
        control: ctrl_rx,
        inbound: inbound_tx,
        events: events_tx,
        rend: rend_tx,
    };
    let reactor = Reactor::new(config, keypair, socket, local.clone(), channels);
    tokio::spawn(async move {
        if let Err(e) = reactor.run().await {
            error!("community reactor exited with error: {}", e);
        }
    });

    Ok(CommunityHandles {
        community: Community {
            ctrl: ctrl_tx,
            local,
        },
        inbound: inbound_rx,
        circuit_events: events_rx,
        rend_events: rend_rx,
    })
}

/// A handle to a running community reactor.
///
/// Cheap to clone; all clones talk to the same reactor.
#[derive(Clone, Debug)]
pub struct Community {
    /// Control channel into the reactor.
    ctrl: mpsc::UnboundedSender<CtrlMsg>,
    /// Our own descriptor, as other peers would see it.
    local: PeerDescriptor,
}

impl Community {
    /// Return our own descriptor: identity, overlay address, and flags.
    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    /// Offer a peer descriptor as a candidate relay.
    ///
    /// The reactor verifies candidates with a probe before using them.
    pub fn add_candidate(&self, desc: PeerDescriptor) {
        let _ = self.ctrl.send(CtrlMsg::AddCandidate { desc });
    }

    /// Start building a circuit.
    ///
    /// `terminal` pins the final hop to a specific peer, as rendezvous
    /// circuits require; data circuits leave it `None` and get an
    /// exit-flagged terminal instead.
    pub async fn create_circuit(
        &self,
        goal_hops: u8,
        kind: CircKind,
        terminal: Option<PeerDescriptor>,
    ) -> Result<PendingCircuit> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::CreateCircuit {
                goal_hops,
                kind,
                terminal,
                tx,
            })
            .map_err(|_| Error::Shutdown)?;
        rx.await?
    }

    /// Watch an existing circuit for readiness.
    pub async fn watch_circuit(&self, circ: CircId) -> Result<oneshot::Receiver<bool>> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::WatchCircuit { circ, tx })
            .map_err(|_| Error::Shutdown)?;
        rx.await?
    }

    /// Send a tunneled payload toward `dest` over `circ`.
    ///
    /// Fire and forget: delivery problems surface as circuit events, not
    /// as errors here.
    pub fn send_data(&self, circ: CircId, dest: SocketAddr, payload: Vec<u8>) {
        let _ = self.ctrl.send(CtrlMsg::SendData {
            circ,
            dest,
            payload,
        });
    }

    /// Send a protocol message to the terminal hop of `circ`.
    pub fn send_msg(&self, circ: CircId, msg: AnyMsg) {
        let _ = self.ctrl.send(CtrlMsg::SendMsg { circ, msg });
    }

    /// Install the end-to-end rendezvous layer on `circ`.
    pub async fn add_end_to_end_layer(
        &self,
        circ: CircId,
        keys: murk_proto::HopKeys,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::AppendE2e { circ, keys, tx })
            .map_err(|_| Error::Shutdown)?;
        rx.await?
    }

    /// Tear down a circuit deliberately.
    pub fn retire_circuit(&self, circ: CircId, reason: DestroyReason) {
        let _ = self.ctrl.send(CtrlMsg::RetireCircuit { circ, reason });
    }

    /// Snapshot every circuit we currently own.
    pub async fn circuits(&self) -> Result<Vec<CircuitInfo>> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::Circuits { tx })
            .map_err(|_| Error::Shutdown)?;
        Ok(rx.await?)
    }

    /// Snapshot the payout ledger: bytes relayed through each peer.
    pub async fn payouts(&self) -> Result<Vec<(murk_cell::PeerId, u64)>> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::Payouts { tx })
            .map_err(|_| Error::Shutdown)?;
        Ok(rx.await?)
    }

    /// Snapshot the descriptors of every candidate that has answered a
    /// probe.  Rendezvous setup picks introduction and rendezvous points
    /// from this list.
    pub async fn verified_candidates(&self) -> Result<Vec<PeerDescriptor>> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::Candidates { tx })
            .map_err(|_| Error::Shutdown)?;
        Ok(rx.await?)
    }

    /// Perform one tunneled TCP request/response exchange through the
    /// exit of `circ`.
    pub async fn http_request(
        &self,
        circ: CircId,
        dest: SocketAddr,
        request: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::HttpRequest {
                circ,
                dest,
                request,
                tx,
            })
            .map_err(|_| Error::Shutdown)?;
        rx.await?
    }

    /// Ask the reactor to shut down.
    pub fn shutdown(&self) {
        let _ = self.ctrl.send(CtrlMsg::Shutdown);
    }
}
