//! The originator's view of one circuit.
//!
//! A [`Circuit`] tracks the hops established so far, the lifecycle state,
//! and the byte and liveness accounting the pool maintenance logic feeds
//! on.  It also owns the seal-everything and peel-everything operations:
//! the transport hands it a payload and gets back the bytes to put on the
//! wire, or vice versa.

use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tracing::{debug, trace};

use murk_cell::{CircId, PeerDescriptor, PeerId};

use crate::{Error, HopKeys, HopLayer, Result};

/// The lifecycle state of a circuit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CircState {
    /// Still being built out toward its goal length.
    Extending,
    /// Fully built and usable for traffic.
    Ready,
    /// Failed; kept only until the owner reaps it.
    Broken,
    /// Being torn down deliberately.
    Closing,
}

impl std::fmt::Display for CircState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircState::Extending => "extending",
            CircState::Ready => "ready",
            CircState::Broken => "broken",
            CircState::Closing => "closing",
        };
        write!(f, "{}", s)
    }
}

/// Why a circuit exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CircKind {
    /// General-purpose circuit for tunneled sessions.
    Data,
    /// Downloader-side rendezvous circuit, terminating at the rendezvous
    /// point.
    RpDownloader,
    /// Seeder-side rendezvous circuit, terminating at the rendezvous
    /// point.
    RpSeeder,
    /// Seeder-side circuit terminating at an introduction point.
    IpSeeder,
}

impl std::fmt::Display for CircKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircKind::Data => "data",
            CircKind::RpDownloader => "rp-downloader",
            CircKind::RpSeeder => "rp-seeder",
            CircKind::IpSeeder => "ip-seeder",
        };
        write!(f, "{}", s)
    }
}

/// One established hop of a circuit.
pub struct Hop {
    /// The descriptor this hop was built from.
    pub peer: PeerDescriptor,
    /// The onion layer shared with this hop.
    pub layer: HopLayer,
}

/// One circuit, as seen by its owner.
pub struct Circuit {
    /// This circuit's identifier at our end of its first link.
    id: CircId,
    /// Why the circuit exists.
    kind: CircKind,
    /// How many hops the circuit is being built out to.
    goal_hops: u8,
    /// Lifecycle state.
    state: CircState,
    /// Established hops, closest first.
    hops: Vec<Hop>,
    /// Extra end-to-end layer behind the terminal hop, if negotiated.
    ///
    /// Present on rendezvous circuits once the two sides have completed
    /// their key exchange.  It seals innermost and opens last, exactly as
    /// one further hop would, but has no address and earns no payout.
    e2e: Option<HopLayer>,
    /// When the circuit was created.
    created_at: Instant,
    /// The last time the circuit carried or acknowledged traffic.
    last_activity: Instant,
    /// Tunneled payload bytes sent.
    bytes_up: u64,
    /// Tunneled payload bytes received.
    bytes_down: u64,
    /// Oneshots to resolve when the circuit becomes ready (or fails).
    ready_watchers: Vec<oneshot::Sender<bool>>,
    /// Keepalive probes sent since the last answer.
    unanswered_pings: u8,
    /// The most recently measured round-trip time to the terminal hop.
    last_rtt: Option<Duration>,
}

impl Circuit {
    /// Create a circuit in the [`CircState::Extending`] state with no hops
    /// yet.
    pub fn new(id: CircId, kind: CircKind, goal_hops: u8) -> Self {
        let now = Instant::now();
        Circuit {
            id,
            kind,
            goal_hops,
            state: CircState::Extending,
            hops: Vec::with_capacity(usize::from(goal_hops)),
            e2e: None,
            created_at: now,
            last_activity: now,
            bytes_up: 0,
            bytes_down: 0,
            ready_watchers: Vec::new(),
            unanswered_pings: 0,
            last_rtt: None,
        }
    }

    /// Return this circuit's identifier.
    pub fn id(&self) -> CircId {
        self.id
    }
    /// Return why this circuit exists.
    pub fn kind(&self) -> CircKind {
        self.kind
    }
    /// Return the current lifecycle state.
    pub fn state(&self) -> CircState {
        self.state
    }
    /// Return the number of hops this circuit is being built out to.
    pub fn goal_hops(&self) -> u8 {
        self.goal_hops
    }
    /// Return the number of hops established so far.
    pub fn hop_count(&self) -> u8 {
        self.hops.len() as u8
    }
    /// Return true if the circuit is ready to carry traffic.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, CircState::Ready)
    }
    /// Return true if the circuit is neither broken nor closing.
    pub fn is_live(&self) -> bool {
        matches!(self.state, CircState::Extending | CircState::Ready)
    }
    /// Return the established hops, closest first.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }
    /// Return the hop adjacent to us, if any.
    pub fn first_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }
    /// Return the hop farthest from us, if any.
    pub fn terminal_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }
    /// Return the time since this circuit was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
    /// Return the time since this circuit last saw traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
    /// Return the tunneled payload bytes sent over this circuit.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }
    /// Return the tunneled payload bytes received over this circuit.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }
    /// Return the most recently measured round-trip time, if any.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Return a oneshot that resolves `true` once the circuit is ready or
    /// `false` once it is known never to be.
    ///
    /// A circuit already in a final state resolves the oneshot at once.
    pub fn watch_ready(&mut self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        match self.state {
            CircState::Ready => {
                let _ = tx.send(true);
            }
            CircState::Broken | CircState::Closing => {
                let _ = tx.send(false);
            }
            CircState::Extending => self.ready_watchers.push(tx),
        }
        rx
    }

    /// Record a newly established hop.
    ///
    /// When this brings the circuit to its goal length it becomes ready
    /// and all watchers resolve.
    pub fn append_hop(&mut self, peer: PeerDescriptor, keys: &HopKeys) -> Result<()> {
        match self.state {
            CircState::Extending => {}
            CircState::Ready => return Err(Error::Internal("hop appended to a complete circuit")),
            CircState::Broken | CircState::Closing => return Err(Error::CircuitClosed),
        }
        self.hops.push(Hop {
            peer,
            layer: HopLayer::new(keys),
        });
        self.last_activity = Instant::now();
        if self.hops.len() >= usize::from(self.goal_hops) {
            self.state = CircState::Ready;
            debug!(circ = %self.id, kind = %self.kind, hops = self.hops.len(), "circuit ready");
            for tx in self.ready_watchers.drain(..) {
                let _ = tx.send(true);
            }
        }
        Ok(())
    }

    /// Install the end-to-end layer negotiated with the far side of a
    /// rendezvous.
    pub fn add_end_to_end_layer(&mut self, keys: &HopKeys) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::CircuitClosed);
        }
        if self.e2e.is_some() {
            return Err(Error::Internal("end-to-end layer already installed"));
        }
        self.e2e = Some(HopLayer::new(keys));
        Ok(())
    }

    /// Return true if the end-to-end layer has been installed.
    pub fn has_end_to_end_layer(&self) -> bool {
        self.e2e.is_some()
    }

    /// Declare this circuit failed.
    ///
    /// Idempotent; pending watchers resolve `false`.
    pub fn mark_broken(&mut self) {
        if matches!(self.state, CircState::Broken) {
            return;
        }
        trace!(circ = %self.id, "circuit broken");
        self.state = CircState::Broken;
        for tx in self.ready_watchers.drain(..) {
            let _ = tx.send(false);
        }
    }

    /// Begin a deliberate teardown.  The circuit stops accepting traffic.
    pub fn begin_close(&mut self) {
        if matches!(self.state, CircState::Broken | CircState::Closing) {
            return;
        }
        self.state = CircState::Closing;
        for tx in self.ready_watchers.drain(..) {
            let _ = tx.send(false);
        }
    }

    /// Seal `payload` for the wire: one layer per hop, innermost layer for
    /// the terminal hop (or the end-to-end layer when present).
    pub fn encrypt_outbound(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.is_live() {
            return Err(Error::CircuitClosed);
        }
        if self.hops.is_empty() {
            return Err(Error::Internal("circuit has no hops to seal for"));
        }
        let mut buf = match self.e2e.as_mut() {
            Some(layer) => layer.seal_outbound(payload)?,
            None => payload.to_vec(),
        };
        for hop in self.hops.iter_mut().rev() {
            buf = hop.layer.seal_outbound(&buf)?;
        }
        self.bytes_up += payload.len() as u64;
        self.last_activity = Instant::now();
        Ok(buf)
    }

    /// Peel every layer from an inbound payload.
    ///
    /// Each hop added exactly one layer on the way in, so this removes one
    /// per hop, then the end-to-end layer when present.  Any failure means
    /// the payload did not travel the full circuit intact.
    pub fn decrypt_inbound(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.is_live() {
            return Err(Error::CircuitClosed);
        }
        let mut buf = payload.to_vec();
        for hop in &self.hops {
            buf = hop.layer.open_inbound(&buf)?;
        }
        if let Some(layer) = &self.e2e {
            buf = layer.open_inbound(&buf)?;
        }
        self.bytes_down += buf.len() as u64;
        self.last_activity = Instant::now();
        Ok(buf)
    }

    /// Record that a keepalive was sent; returns how many are now
    /// unanswered.
    pub fn note_ping_sent(&mut self) -> u8 {
        self.unanswered_pings = self.unanswered_pings.saturating_add(1);
        self.unanswered_pings
    }

    /// Record a keepalive answer and the round trip it measured.
    pub fn note_pong(&mut self, rtt: Duration) {
        self.unanswered_pings = 0;
        self.last_rtt = Some(rtt);
        self.last_activity = Instant::now();
    }

    /// Take a snapshot of this circuit for reporting.
    pub fn info(&self) -> CircuitInfo {
        CircuitInfo {
            id: self.id,
            kind: self.kind,
            state: self.state,
            hop_count: self.hop_count(),
            goal_hops: self.goal_hops,
            hops: self.hops.iter().map(|h| h.peer.id).collect(),
            age: self.age(),
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            last_rtt: self.last_rtt,
        }
    }
}

/// A point-in-time snapshot of one circuit, safe to hand across tasks.
#[derive(Clone, Debug)]
pub struct CircuitInfo {
    /// The circuit's identifier.
    pub id: CircId,
    /// Why the circuit exists.
    pub kind: CircKind,
    /// Lifecycle state at snapshot time.
    pub state: CircState,
    /// Hops established at snapshot time.
    pub hop_count: u8,
    /// Hops the circuit is being built out to.
    pub goal_hops: u8,
    /// Identities of the established hops, closest first.
    pub hops: Vec<PeerId>,
    /// Time since the circuit was created.
    pub age: Duration,
    /// Tunneled payload bytes sent.
    pub bytes_up: u64,
    /// Tunneled payload bytes received.
    pub bytes_down: u64,
    /// Most recently measured round-trip time, if any.
    pub last_rtt: Option<Duration>,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use murk_cell::PeerFlags;

    fn desc(seed: u8) -> PeerDescriptor {
        PeerDescriptor {
            id: PeerId::from_bytes([seed; 20]),
            addr: format!("127.0.0.1:{}", 9000 + u16::from(seed)).parse().unwrap(),
            tunnel_key: [seed; 32],
            flags: PeerFlags::RELAY,
        }
    }

    fn keys(seed: u8) -> HopKeys {
        HopKeys {
            fwd: [seed; 32],
            bwd: [seed ^ 0xff; 32],
        }
    }

    fn circ_id(n: u32) -> CircId {
        CircId::new(n).unwrap()
    }

    #[test]
    fn builds_to_goal_and_resolves_watchers() {
        let mut circ = Circuit::new(circ_id(1), CircKind::Data, 2);
        let mut early = circ.watch_ready();
        assert_eq!(early.try_recv().unwrap(), None);

        circ.append_hop(desc(1), &keys(1)).unwrap();
        assert_eq!(circ.state(), CircState::Extending);
        circ.append_hop(desc(2), &keys(2)).unwrap();
        assert_eq!(circ.state(), CircState::Ready);
        assert_eq!(circ.hop_count(), 2);
        assert_eq!(early.try_recv().unwrap(), Some(true));

        // A watcher attached after readiness resolves at once.
        let mut late = circ.watch_ready();
        assert_eq!(late.try_recv().unwrap(), Some(true));
    }

    #[test]
    fn broken_resolves_watchers_false_and_is_idempotent() {
        let mut circ = Circuit::new(circ_id(2), CircKind::Data, 3);
        let mut watcher = circ.watch_ready();
        circ.append_hop(desc(1), &keys(1)).unwrap();
        circ.mark_broken();
        circ.mark_broken();
        assert_eq!(circ.state(), CircState::Broken);
        assert_eq!(watcher.try_recv().unwrap(), Some(false));
        assert!(matches!(
            circ.append_hop(desc(2), &keys(2)),
            Err(Error::CircuitClosed)
        ));
        assert!(matches!(
            circ.encrypt_outbound(b"payload"),
            Err(Error::CircuitClosed)
        ));
    }

    #[test]
    fn extra_hop_past_goal_rejected() {
        let mut circ = Circuit::new(circ_id(3), CircKind::Data, 1);
        circ.append_hop(desc(1), &keys(1)).unwrap();
        assert!(matches!(
            circ.append_hop(desc(2), &keys(2)),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn layers_peel_in_relay_order() {
        let mut circ = Circuit::new(circ_id(4), CircKind::Data, 3);
        for i in 1..=3 {
            circ.append_hop(desc(i), &keys(i)).unwrap();
        }

        let wire = circ.encrypt_outbound(b"all the way out").unwrap();
        assert_eq!(wire.len(), b"all the way out".len() + 3 * crate::LAYER_OVERHEAD);

        // Walk the datagram through each relay's side of the layer.
        let mut buf = wire;
        for i in 1..=3 {
            let relay = HopLayer::new(&keys(i));
            buf = relay.open_outbound(&buf).unwrap();
        }
        assert_eq!(buf, b"all the way out");
    }

    #[test]
    fn inbound_path_reverses_the_seals() {
        let mut circ = Circuit::new(circ_id(5), CircKind::Data, 2);
        circ.append_hop(desc(1), &keys(1)).unwrap();
        circ.append_hop(desc(2), &keys(2)).unwrap();

        // The terminal relay seals first, then the closer relay.
        let mut relay2 = HopLayer::new(&keys(2));
        let mut relay1 = HopLayer::new(&keys(1));
        let buf = relay2.seal_inbound(b"coming home").unwrap();
        let buf = relay1.seal_inbound(&buf).unwrap();

        assert_eq!(circ.decrypt_inbound(&buf).unwrap(), b"coming home");
        assert_eq!(circ.bytes_down(), b"coming home".len() as u64);
    }

    #[test]
    fn end_to_end_layer_seals_innermost() {
        let mut circ = Circuit::new(circ_id(6), CircKind::RpDownloader, 2);
        circ.append_hop(desc(1), &keys(1)).unwrap();
        circ.append_hop(desc(2), &keys(2)).unwrap();
        circ.add_end_to_end_layer(&keys(9)).unwrap();
        assert!(circ.has_end_to_end_layer());

        let wire = circ.encrypt_outbound(b"secret").unwrap();
        let mut buf = wire;
        for i in 1..=2 {
            let relay = HopLayer::new(&keys(i));
            buf = relay.open_outbound(&buf).unwrap();
        }
        // What the rendezvous point forwards is still sealed end to end.
        assert_ne!(buf, b"secret");
        let far_side = HopLayer::new(&keys(9));
        assert_eq!(far_side.open_outbound(&buf).unwrap(), b"secret");
    }

    #[test]
    fn byte_counters_accumulate() {
        let mut circ = Circuit::new(circ_id(7), CircKind::Data, 1);
        circ.append_hop(desc(1), &keys(1)).unwrap();
        circ.encrypt_outbound(&[0; 100]).unwrap();
        circ.encrypt_outbound(&[0; 50]).unwrap();
        assert_eq!(circ.bytes_up(), 150);
        assert_eq!(circ.info().bytes_up, 150);
    }

    #[test]
    fn ping_accounting() {
        let mut circ = Circuit::new(circ_id(8), CircKind::Data, 1);
        circ.append_hop(desc(1), &keys(1)).unwrap();
        assert_eq!(circ.note_ping_sent(), 1);
        assert_eq!(circ.note_ping_sent(), 2);
        circ.note_pong(Duration::from_millis(40));
        assert_eq!(circ.note_ping_sent(), 1);
        assert_eq!(circ.last_rtt(), Some(Duration::from_millis(40)));
    }
}
