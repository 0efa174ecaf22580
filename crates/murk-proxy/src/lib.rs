//! The local SOCKS5 front for murk tunnels.
//!
//! # Overview
//!
//! A BitTorrent client does not know it is being tunneled; it just talks
//! to a SOCKS5 proxy on localhost.  This crate runs N such proxies, one
//! per hop count: a client that wants three hops of cover connects to the
//! third instance, and everything it sends rides circuits of exactly that
//! length.
//!
//! Behind the listeners sits the **dispatcher**, the bridge between
//! per-session SOCKS traffic and the circuit pool.  It remembers which
//! circuit carries each (session, destination) pair, picks or builds
//! circuits when a pair is new, routes tunneled payloads back to the
//! right client socket, and cleans up when circuits or sessions die.
//! Hidden-service traffic uses an address trick: a destination whose port
//! is [`murk_cell::CIRCUIT_ID_PORT`] names a rendezvous circuit directly,
//! so a local client can speak to an anonymous peer it knows only by
//! circuit.
//!
//! TCP CONNECT is supported for one-shot request/response exchanges
//! (tracker announces over HTTP): the request bytes are tunneled to an
//! exit, and the response is written back before the connection closes.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use murk_community::{CircuitEvent, Community, InboundData};

mod dispatcher;
mod server;

pub use dispatcher::SessionId;

use dispatcher::{DispMsg, Dispatcher};

/// An error from the SOCKS front.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Could not bind a SOCKS listener.
    #[error("Cannot bind SOCKS listener on {addr}")]
    Bind {
        /// The address we tried to listen on.
        addr: SocketAddr,
        /// What went wrong.
        #[source]
        err: Arc<std::io::Error>,
    },

    /// The configuration cannot be served.
    #[error("Bad proxy configuration: {0}")]
    Config(&'static str),

    /// A connection-level I/O failure.
    #[error("SOCKS connection I/O error")]
    Io(#[source] Arc<std::io::Error>),

    /// The client violated the SOCKS protocol.
    #[error("SOCKS protocol error")]
    Socks(#[from] murk_socks::Error),

    /// The overlay underneath us failed.
    #[error("Community error")]
    Community(#[from] murk_community::Error),

    /// The client's handshake did not fit the buffer.
    #[error("SOCKS handshake did not fit in {0} bytes")]
    HandshakeTooLong(usize),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

/// A [`Result`](std::result::Result) with a proxy [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for the SOCKS front.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// TCP ports to listen on, one instance per entry.  The i-th entry
    /// (1-based) serves circuits of i hops.  Port 0 asks the OS for a
    /// free port.
    pub socks_listen_ports: Vec<u16>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            socks_listen_ports: vec![1080],
        }
    }
}

/// A running SOCKS front.
#[derive(Debug)]
pub struct Proxy {
    /// Control channel into the dispatcher.
    dispatcher: mpsc::UnboundedSender<DispMsg>,
    /// The bound listener addresses, in hop order.
    addrs: Vec<SocketAddr>,
    /// The accept-loop tasks.
    listeners: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// The addresses the instances are listening on, in hop order.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Stop accepting connections and shut the dispatcher down.
    ///
    /// Established sessions are dropped; the local client sees its proxy
    /// go away, which is the signal it gets on process exit too.
    pub fn shutdown(&self) {
        for listener in &self.listeners {
            listener.abort();
        }
        let _ = self.dispatcher.send(DispMsg::Shutdown);
    }
}

/// Bind the SOCKS listeners and start the dispatcher.
///
/// Takes the inbound payload queue and the circuit event stream that
/// [`murk_community::launch`] handed back; the dispatcher consumes both.
pub async fn launch(
    community: Community,
    config: ProxyConfig,
    inbound: mpsc::Receiver<InboundData>,
    circuit_events: mpsc::UnboundedReceiver<CircuitEvent>,
) -> Result<Proxy> {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let mut addrs = Vec::new();
    let mut listeners = Vec::new();
    for (i, port) in config.socks_listen_ports.iter().enumerate() {
        let hops =
            u8::try_from(i + 1).map_err(|_| Error::Config("too many SOCKS instances"))?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port);
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::Bind {
            addr,
            err: Arc::new(e),
        })?;
        let bound = listener.local_addr().map_err(|e| Error::Bind {
            addr,
            err: Arc::new(e),
        })?;
        info!(hops, addr = %bound, "SOCKS instance listening");
        addrs.push(bound);
        listeners.push(tokio::spawn(server::run_instance(
            listener,
            hops,
            community.clone(),
            msg_tx.clone(),
        )));
    }

    let dispatcher = Dispatcher::new(
        community,
        config.socks_listen_ports.len(),
        msg_tx.clone(),
        msg_rx,
        inbound,
        circuit_events,
    );
    tokio::spawn(dispatcher.run());

    Ok(Proxy {
        dispatcher: msg_tx,
        addrs,
        listeners,
    })
}
