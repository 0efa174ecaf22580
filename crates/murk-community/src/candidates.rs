//! The candidate table: relays we have heard of and may route through.
//!
//! Candidates arrive from bootstrap configuration, from the exit cache,
//! and from whatever discovery the embedding application does.  They are
//! not trusted on arrival: a candidate only becomes eligible for circuit
//! building once it has answered a liveness probe, and it loses that
//! status again if it goes quiet for too long.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng};
use tracing::{debug, warn};

use murk_cell::{PeerDescriptor, PeerId};
use murk_proto::handshake::peer_id_for_key;

/// One known peer and what we know about its liveness.
#[derive(Clone, Debug)]
pub(crate) struct Candidate {
    /// The peer's descriptor.
    pub(crate) desc: PeerDescriptor,
    /// Whether the peer has answered a probe since we last had reason to
    /// doubt it.
    pub(crate) verified: bool,
    /// When we last heard from the peer (or first learned of it).
    pub(crate) last_seen: Instant,
    /// When we last sent the peer a probe.
    last_probe: Option<Instant>,
}

/// The set of candidate relays, keyed by peer id.
#[derive(Debug)]
pub(crate) struct CandidateSet {
    /// All candidates we currently remember.
    by_id: HashMap<PeerId, Candidate>,
    /// Our own id; we never route through ourselves.
    local_id: PeerId,
}

impl CandidateSet {
    /// Make an empty set for a peer with the given identity.
    pub(crate) fn new(local_id: PeerId) -> Self {
        CandidateSet {
            by_id: HashMap::new(),
            local_id,
        }
    }

    /// Add or refresh a candidate.  Returns true if the table changed.
    ///
    /// A descriptor whose id does not match its tunnel key is discarded:
    /// either it was corrupted in transit or someone is lying.
    pub(crate) fn insert(&mut self, desc: PeerDescriptor, now: Instant) -> bool {
        if desc.id == self.local_id {
            return false;
        }
        if peer_id_for_key(&desc.tunnel_key) != desc.id {
            warn!(peer = %desc.id, "discarding candidate whose id does not match its key");
            return false;
        }
        match self.by_id.get_mut(&desc.id) {
            Some(c) => {
                // A changed key or address means whatever we verified
                // before no longer holds.
                if c.desc.tunnel_key != desc.tunnel_key || c.desc.addr != desc.addr {
                    c.verified = false;
                    c.last_probe = None;
                }
                c.desc = desc;
                true
            }
            None => {
                debug!(peer = %desc.id, addr = %desc.addr, "new candidate");
                self.by_id.insert(
                    desc.id,
                    Candidate {
                        desc,
                        verified: false,
                        last_seen: now,
                        last_probe: None,
                    },
                );
                true
            }
        }
    }

    /// Record that the peer listening on `addr` answered a probe.
    pub(crate) fn mark_verified(&mut self, addr: SocketAddr, now: Instant) -> Option<PeerId> {
        let c = self.by_id.values_mut().find(|c| c.desc.addr == addr)?;
        if !c.verified {
            debug!(peer = %c.desc.id, "candidate verified");
        }
        c.verified = true;
        c.last_seen = now;
        Some(c.desc.id)
    }

    /// Record any traffic heard from `addr`, which counts as liveness.
    pub(crate) fn note_activity(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(c) = self.by_id.values_mut().find(|c| c.desc.addr == addr) {
            c.last_seen = now;
        }
    }

    /// Pick the candidates due for a liveness probe.
    ///
    /// Unverified candidates are probed eagerly; verified ones only once
    /// they have been quiet for half their expiry, so that a live relay
    /// is reconfirmed before [`expire`](Self::expire) would drop it.
    pub(crate) fn due_for_probe(
        &mut self,
        now: Instant,
        probe_interval: Duration,
        expiry: Duration,
    ) -> Vec<SocketAddr> {
        let mut due = Vec::new();
        for c in self.by_id.values_mut() {
            let quiet = now.duration_since(c.last_seen);
            let wants = if c.verified { quiet >= expiry / 2 } else { true };
            let probe_ok = c
                .last_probe
                .map(|t| now.duration_since(t) >= probe_interval)
                .unwrap_or(true);
            if wants && probe_ok {
                c.last_probe = Some(now);
                due.push(c.desc.addr);
            }
        }
        due
    }

    /// Drop candidates that have been quiet past `expiry`.
    pub(crate) fn expire(&mut self, now: Instant, expiry: Duration) -> Vec<PeerId> {
        let dead: Vec<PeerId> = self
            .by_id
            .values()
            .filter(|c| now.duration_since(c.last_seen) >= expiry)
            .map(|c| c.desc.id)
            .collect();
        for id in &dead {
            debug!(peer = %id, "candidate expired");
            self.by_id.remove(id);
        }
        dead
    }

    /// Choose one verified relay for the next hop of a circuit.
    ///
    /// Peers already in the circuit are excluded by id and by IP address,
    /// so a path never visits the same operator twice.  When `need_exit`
    /// is set only exit-flagged peers qualify.
    pub(crate) fn pick_hop<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        exclude_ids: &[PeerId],
        exclude_ips: &[IpAddr],
        need_exit: bool,
    ) -> Option<PeerDescriptor> {
        let eligible: Vec<&Candidate> = self
            .by_id
            .values()
            .filter(|c| c.verified)
            .filter(|c| c.desc.is_relay())
            .filter(|c| !need_exit || c.desc.is_exit())
            .filter(|c| !exclude_ids.contains(&c.desc.id))
            .filter(|c| !exclude_ips.contains(&c.desc.addr.ip()))
            .collect();
        eligible.choose(rng).map(|c| c.desc.clone())
    }

    /// Look up a candidate's descriptor by id.
    pub(crate) fn get(&self, id: &PeerId) -> Option<&PeerDescriptor> {
        self.by_id.get(id).map(|c| &c.desc)
    }

    /// Iterate over every candidate, for persistence.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.by_id.values()
    }

    /// How many candidates are currently verified.
    pub(crate) fn n_verified(&self) -> usize {
        self.by_id.values().filter(|c| c.verified).count()
    }

    /// How many candidates we remember in total.
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}
