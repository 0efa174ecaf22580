//! The payout ledger: how many bytes each relay carried for us.
//!
//! Relaying is paid work.  Every circuit counts the payload bytes it
//! moves in either direction, and when the circuit ends (for any reason)
//! that total is credited once to every relay that was on its path.  The
//! embedding application reads the ledger and settles up out of band.

use std::collections::HashMap;

use tracing::debug;

use murk_cell::PeerId;
use murk_proto::Circuit;

/// Accumulated per-peer relay totals.
#[derive(Debug, Default)]
pub(crate) struct PayoutLedger {
    /// Total payload bytes relayed, per peer.
    totals: HashMap<PeerId, u64>,
}

impl PayoutLedger {
    /// Credit every relay on `circ`'s path with the bytes it carried.
    ///
    /// Called exactly once, when the circuit is torn down.
    pub(crate) fn credit_circuit(&mut self, circ: &Circuit) {
        let carried = circ.bytes_up().saturating_add(circ.bytes_down());
        if carried == 0 {
            return;
        }
        for hop in circ.hops() {
            let total = self.totals.entry(hop.peer.id).or_insert(0);
            *total = total.saturating_add(carried);
        }
        debug!(
            circ = %circ.id(),
            bytes = carried,
            hops = circ.hop_count(),
            "credited circuit to its relays"
        );
    }

    /// Snapshot the ledger as (peer, bytes) pairs.
    pub(crate) fn snapshot(&self) -> Vec<(PeerId, u64)> {
        let mut all: Vec<(PeerId, u64)> = self.totals.iter().map(|(k, v)| (*k, *v)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use murk_cell::{CircId, PeerDescriptor, PeerFlags};
    use murk_proto::{CircKind, HopKeys, TunnelKeypair};
    use std::net::SocketAddr;

    fn peer(port: u16) -> PeerDescriptor {
        let kp = TunnelKeypair::generate(&mut rand::thread_rng());
        PeerDescriptor {
            id: kp.peer_id(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            tunnel_key: kp.public_bytes(),
            flags: PeerFlags::RELAY,
        }
    }

    fn ready_circuit(hops: &[PeerDescriptor]) -> Circuit {
        let mut c = Circuit::new(
            CircId::new(7).unwrap(),
            CircKind::Data,
            hops.len() as u8,
        );
        for h in hops {
            c.append_hop(h.clone(), &HopKeys::new([1; 32], [2; 32]))
                .unwrap();
        }
        c
    }

    #[test]
    fn every_hop_is_credited_the_full_total() {
        let a = peer(5001);
        let b = peer(5002);
        let mut circ = ready_circuit(&[a.clone(), b.clone()]);
        circ.encrypt_outbound(&[0u8; 100]).unwrap();

        let mut ledger = PayoutLedger::default();
        ledger.credit_circuit(&circ);
        let snap = ledger.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().all(|(_, bytes)| *bytes == 100));
        assert!(snap.iter().any(|(id, _)| *id == a.id));
        assert!(snap.iter().any(|(id, _)| *id == b.id));
    }

    #[test]
    fn idle_circuits_credit_nothing() {
        let mut ledger = PayoutLedger::default();
        ledger.credit_circuit(&ready_circuit(&[peer(5003)]));
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn totals_accumulate_across_circuits() {
        let shared = peer(5004);
        let mut first = ready_circuit(&[shared.clone()]);
        first.encrypt_outbound(&[0u8; 10]).unwrap();
        let mut second = ready_circuit(&[shared.clone()]);
        second.encrypt_outbound(&[0u8; 30]).unwrap();

        let mut ledger = PayoutLedger::default();
        ledger.credit_circuit(&first);
        ledger.credit_circuit(&second);
        assert_eq!(ledger.snapshot(), vec![(shared.id, 40)]);
    }
}
