//! Hidden-service rendezvous on top of the murk overlay.
//!
//! # Overview
//!
//! A peer can *seed* content without revealing its address.  The seeder
//! builds a circuit to a chosen relay and asks it to act as an
//! **introduction point**; the (service, introduction point) pair goes
//! into the DHT.  A downloader looks the service up, picks its own
//! **rendezvous point**, parks a circuit there with a fresh cookie, and
//! sends the seeder an introduction naming the rendezvous point and the
//! cookie, sealed to the service key.  The seeder answers by building its
//! own circuit to the rendezvous point; the rendezvous point splices the
//! two half-circuits into one, and an end-to-end encryption layer keeps
//! the relays in the middle blind.  Neither end ever learns the other's
//! address.
//!
//! This crate drives both roles over a running
//! [`Community`](murk_community::Community).  A small background task
//! watches the community's rendezvous signals and routes them to whoever
//! is waiting; [`RendClient::serve`] and [`RendClient::connect`] are the
//! two entry points.  The DHT itself is behind the [`DhtProvider`] trait;
//! [`InMemoryDht`] is enough for tests and single-process setups.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

use std::time::Duration;

mod dht;
mod driver;
mod intro;

pub use dht::{DhtProvider, InMemoryDht};
pub use driver::{launch, RendClient};

/// An error from a rendezvous operation.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The DHT has no introduction points for the service.
    #[error("Service not found in the DHT")]
    NotFound,

    /// No verified relay was available for the role we needed to fill.
    #[error("No suitable relay available")]
    NoRelay,

    /// The overlay layer failed underneath us.
    #[error("Community error")]
    Community(#[from] murk_community::Error),

    /// A handshake or layer operation failed.
    #[error("Protocol error")]
    Proto(#[from] murk_proto::Error),

    /// A peer sent something that does not parse.
    #[error("Malformed rendezvous payload")]
    Malformed,

    /// The other side did not answer in time.
    #[error("Rendezvous timed out")]
    Timeout,

    /// The rendezvous driver has shut down.
    #[error("Rendezvous driver has shut down")]
    Shutdown,

    /// Something that should not happen happened.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// A [`Result`](std::result::Result) with a rendezvous [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Tuning knobs for the rendezvous driver.
///
/// The hop counts name the relays *before* the terminal point, so the
/// downloader's rendezvous circuit has `dl_hops + 1` hops counting the
/// rendezvous point itself, and a spliced end-to-end path crosses
/// `dl_hops + sr_hops + 1` relays in total.
#[derive(Clone, Debug)]
pub struct RendConfig {
    /// Relays between a downloader and its rendezvous point.
    pub dl_hops: u8,
    /// Relays between a seeder and the rendezvous point.
    pub sr_hops: u8,
    /// Relays between a seeder and its introduction point.
    pub intro_hops: u8,
    /// How long to wait for each protocol acknowledgement.
    pub connect_timeout: Duration,
}

impl Default for RendConfig {
    fn default() -> Self {
        RendConfig {
            dl_hops: 1,
            sr_hops: 1,
            intro_hops: 1,
            connect_timeout: Duration::from_secs(30),
        }
    }
}
