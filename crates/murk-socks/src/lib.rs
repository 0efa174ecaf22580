//! Implement the subset of the SOCKS5 protocol that fronts the murk
//! tunnels.
//!
//! # Overview
//!
//! A BitTorrent client reaches the tunnel subsystem through an ordinary
//! SOCKS5 proxy on localhost.  This crate implements the proxy's side of
//! that conversation: the method negotiation, the request, and the framing
//! of UDP datagrams relayed for a UDP ASSOCIATE session.
//!
//! Only what the tunnels need is spoken here.  That means SOCKS version 5,
//! the "no authentication" method, and the CONNECT and UDP ASSOCIATE
//! commands; everything else is answered with the appropriate refusal.
//!
//! This crate does no I/O.  The caller reads bytes, feeds them to a
//! [`SocksProxyHandshake`], and acts on the returned [`Action`]: drain
//! this many bytes from the input buffer, send this reply, and note
//! whether the handshake is over.  This keeps the protocol testable
//! without sockets and leaves buffering strategy to the proxy.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

mod handshake;
pub mod msg;

pub use handshake::{Action, SocksProxyHandshake};
pub use msg::{SocksAddr, SocksCmd, SocksRequest, SocksStatus, UdpHeader};

/// An error that occurs while negotiating a SOCKS handshake, or while
/// decoding a SOCKS message.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The SOCKS client's message was incomplete; keep reading and try
    /// again with more bytes.
    #[error("Message truncated; wait for more bytes")]
    Truncated,

    /// The message violates the SOCKS protocol.
    #[error("SOCKS protocol syntax violation")]
    Syntax,

    /// The client asked for a SOCKS version we do not speak.
    #[error("Asked to use SOCKS version {0}, which we don't support")]
    BadProtocol(u8),

    /// The handshake is already finished; there is nothing more to feed
    /// it.
    #[error("SOCKS handshake already finished")]
    AlreadyFinished,

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl From<murk_bytes::Error> for Error {
    fn from(e: murk_bytes::Error) -> Error {
        match e {
            murk_bytes::Error::Truncated => Error::Truncated,
            _ => Error::Syntax,
        }
    }
}

/// A Result type for this crate's functions.
pub type Result<T> = std::result::Result<T, Error>;
