//! Circuit cryptography and circuit state for the murk tunnel protocol.
//!
//! # Overview
//!
//! This crate holds everything about a circuit that does not touch the
//! network:
//!
//! * [`handshake`] establishes a pair of symmetric keys with one hop.  The
//!   exchange is an ntor-style one-way-authenticated Diffie-Hellman over
//!   X25519: the initiator stays anonymous, the hop proves possession of
//!   the private counterpart of its advertised tunnel key.
//! * [`HopLayer`] applies and removes one hop's onion layer.  Each layer is
//!   ChaCha20-Poly1305 with independent keys per direction and an explicit
//!   sequence number on the wire, so losing a datagram never
//!   desynchronizes the remaining traffic.
//! * [`Circuit`] is the originator's view of one circuit: its hops, its
//!   lifecycle state, and the seal-everything / peel-everything operations
//!   the transport calls for each datagram.
//!
//! Driving a circuit (sending the cells, choosing the hops, reacting to
//! timeouts) happens in `murk-community`; this crate only answers "what are
//! the bytes" and "what state is the circuit in now".

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

mod circuit;
mod crypto;
pub mod handshake;

pub use circuit::{CircKind, CircState, Circuit, CircuitInfo, Hop};
pub use crypto::{HopLayer, LAYER_OVERHEAD};
pub use handshake::{HopKeys, TunnelKeypair};

/// An error produced by circuit cryptography or circuit state handling.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A handshake message did not follow the protocol.
    #[error("Handshake protocol violation: {0}")]
    HandshakeProto(&'static str),

    /// A handshake reply failed to authenticate.
    ///
    /// Either the peer does not hold the private key matching the tunnel
    /// key we dialed, or somebody altered the reply in transit.
    #[error("Handshake authentication failed")]
    BadHandshakeAuth,

    /// A layered payload was too short or failed to authenticate.
    #[error("Unable to remove an onion layer")]
    BadCiphertext,

    /// A per-hop sequence counter ran out.
    ///
    /// The circuit has to be torn down; continuing would reuse a nonce.
    #[error("Layer sequence numbers exhausted")]
    SeqExhausted,

    /// The operation needed a live circuit, but this one is broken or
    /// closing.
    #[error("Circuit is no longer usable")]
    CircuitClosed,

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// A Result type for this crate's functions.
pub type Result<T> = std::result::Result<T, Error>;
