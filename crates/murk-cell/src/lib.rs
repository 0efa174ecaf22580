//! Coding and decoding for the cells that make up the murk tunnel protocol.
//!
//! # Overview
//!
//! The murk overlay carries all traffic between peers as **cells**: small
//! framed messages, one per UDP datagram.  A cell has a six-byte header
//! (circuit id, command, flags) followed by a command-specific payload.
//! Everything a circuit does (extension, data transport, teardown,
//! keepalives, and the hidden-service rendezvous handshake) is one of the
//! commands defined here.
//!
//! This crate is about encoding and decoding only.  The layered encryption
//! that protects most payloads is applied elsewhere; from this crate's
//! point of view an encrypted payload is just bytes.  Cells whose payload
//! travels in the clear (the link-level handshake and teardown commands)
//! have typed bodies in [`msg`].
//!
//! Everything here is protocol-independent of any async runtime and does
//! no I/O.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

mod cell;
mod ids;
pub mod msg;
mod peer;

pub use cell::{CellCmd, CircId, RawCell, CELL_HEADER_LEN};
pub use ids::{PeerId, RendCookie, ServiceId, ID_LEN};
pub use peer::{PeerDescriptor, PeerFlags};

pub use murk_bytes::{EncodeError, EncodeResult, Error, Result};

/// The UDP port value reserved as the *circuit-id port*.
///
/// A SOCKS UDP request whose destination port is this value is not a real
/// destination: its IPv4 address bytes encode a circuit id instead, and the
/// datagram is routed onto that circuit directly.  Used for hidden-service
/// traffic, where the remote peer has no routable address.
pub const CIRCUIT_ID_PORT: u16 = 1024;

/// Build the synthetic socket address that stands in for a circuit.
///
/// The circuit id becomes the four IPv4 address bytes; the port is
/// [`CIRCUIT_ID_PORT`].
pub fn circuit_id_to_addr(circ: CircId) -> std::net::SocketAddr {
    let ip = std::net::Ipv4Addr::from(u32::from(circ));
    std::net::SocketAddr::new(ip.into(), CIRCUIT_ID_PORT)
}

/// If `addr` is a synthetic circuit address, return the circuit id it
/// encodes.
pub fn addr_to_circuit_id(addr: &std::net::SocketAddr) -> Option<CircId> {
    if addr.port() != CIRCUIT_ID_PORT {
        return None;
    }
    match addr.ip() {
        std::net::IpAddr::V4(ip) => CircId::new(u32::from(ip)),
        std::net::IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn circuit_addr_round_trip() {
        let circ = CircId::new(0x2a).unwrap();
        let addr = circuit_id_to_addr(circ);
        assert_eq!(addr.to_string(), "0.0.0.42:1024");
        assert_eq!(addr_to_circuit_id(&addr), Some(circ));

        // Wrong port: not a circuit address.
        let other: std::net::SocketAddr = "0.0.0.42:1025".parse().unwrap();
        assert_eq!(addr_to_circuit_id(&other), None);
        // Zero is not a valid circuit id.
        let zero: std::net::SocketAddr = "0.0.0.0:1024".parse().unwrap();
        assert_eq!(addr_to_circuit_id(&zero), None);
    }
}
