//! Message types returned by the SOCKS proxy handshake, and the framing
//! for relayed UDP datagrams.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use murk_bytes::{EncodeResult, Readable, Reader, Writeable, Writer};

use crate::{Error, Result};

/// A SOCKS command.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SocksCmd(u8);

impl SocksCmd {
    /// Connect to one TCP endpoint.
    pub const CONNECT: SocksCmd = SocksCmd(1);
    /// Bind a listening address.  Not supported here.
    pub const BIND: SocksCmd = SocksCmd(2);
    /// Relay UDP datagrams on the client's behalf.
    pub const UDP_ASSOCIATE: SocksCmd = SocksCmd(3);

    /// Return true if this is a command the murk proxy carries out.
    pub fn recognized(self) -> bool {
        matches!(self, SocksCmd::CONNECT | SocksCmd::UDP_ASSOCIATE)
    }
}

impl From<u8> for SocksCmd {
    fn from(v: u8) -> Self {
        SocksCmd(v)
    }
}
impl From<SocksCmd> for u8 {
    fn from(c: SocksCmd) -> u8 {
        c.0
    }
}

/// A SOCKS response status code.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SocksStatus(u8);

impl SocksStatus {
    /// The request succeeded.
    pub const SUCCEEDED: SocksStatus = SocksStatus(0);
    /// Something went wrong inside the proxy.
    pub const GENERAL_FAILURE: SocksStatus = SocksStatus(1);
    /// The ruleset does not permit this connection.
    pub const NOT_ALLOWED: SocksStatus = SocksStatus(2);
    /// The destination network is unreachable.
    pub const NETWORK_UNREACHABLE: SocksStatus = SocksStatus(3);
    /// The destination host is unreachable.
    pub const HOST_UNREACHABLE: SocksStatus = SocksStatus(4);
    /// The destination refused the connection.
    pub const CONNECTION_REFUSED: SocksStatus = SocksStatus(5);
    /// The connection timed out.
    pub const TTL_EXPIRED: SocksStatus = SocksStatus(6);
    /// The client sent a command we do not implement.
    pub const COMMAND_NOT_SUPPORTED: SocksStatus = SocksStatus(7);
    /// The client sent an address type we do not implement.
    pub const ADDRTYPE_NOT_SUPPORTED: SocksStatus = SocksStatus(8);
}

impl From<u8> for SocksStatus {
    fn from(v: u8) -> Self {
        SocksStatus(v)
    }
}
impl From<SocksStatus> for u8 {
    fn from(s: SocksStatus) -> u8 {
        s.0
    }
}

/// An address as it appears in a SOCKS message: either an IP address or a
/// hostname still to be resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocksAddr {
    /// An IP address.
    Ip(IpAddr),
    /// A hostname.
    Hostname(String),
}

impl SocksAddr {
    /// If this address is an IP address, pair it with `port` as a socket
    /// address.
    pub fn to_socket_addr(&self, port: u16) -> Option<SocketAddr> {
        match self {
            SocksAddr::Ip(ip) => Some(SocketAddr::new(*ip, port)),
            SocksAddr::Hostname(_) => None,
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(ip) => ip.fmt(f),
            SocksAddr::Hostname(h) => h.fmt(f),
        }
    }
}

/// SOCKS5 address type tag for an IPv4 address.
const ATYP_V4: u8 = 1;
/// SOCKS5 address type tag for a hostname.
const ATYP_HOSTNAME: u8 = 3;
/// SOCKS5 address type tag for an IPv6 address.
const ATYP_V6: u8 = 4;

impl Readable for SocksAddr {
    fn take_from(r: &mut Reader<'_>) -> murk_bytes::Result<Self> {
        match r.take_u8()? {
            ATYP_V4 => {
                let ip: std::net::Ipv4Addr = r.extract()?;
                Ok(SocksAddr::Ip(ip.into()))
            }
            ATYP_V6 => {
                let ip: std::net::Ipv6Addr = r.extract()?;
                Ok(SocksAddr::Ip(ip.into()))
            }
            ATYP_HOSTNAME => {
                let name = r.take_u8_prefixed()?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| murk_bytes::Error::BadMessage("hostname is not utf-8"))?;
                Ok(SocksAddr::Hostname(name.to_string()))
            }
            _ => Err(murk_bytes::Error::BadMessage("unrecognized address type")),
        }
    }
}

impl Writeable for SocksAddr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        match self {
            SocksAddr::Ip(IpAddr::V4(ip)) => {
                w.write_u8(ATYP_V4);
                w.write(ip)?;
            }
            SocksAddr::Ip(IpAddr::V6(ip)) => {
                w.write_u8(ATYP_V6);
                w.write(ip)?;
            }
            SocksAddr::Hostname(name) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| murk_bytes::EncodeError::BadLengthValue)?;
                w.write_u8(ATYP_HOSTNAME);
                w.write_u8(len);
                w.write_all(name.as_bytes());
            }
        }
        Ok(())
    }
}

/// A completed SOCKS request: what the client wants from the proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksRequest {
    /// The command to carry out.
    cmd: SocksCmd,
    /// The destination address.
    addr: SocksAddr,
    /// The destination port.
    port: u16,
}

impl SocksRequest {
    /// Construct a request.  Only used by the handshake.
    pub(crate) fn new(cmd: SocksCmd, addr: SocksAddr, port: u16) -> Self {
        SocksRequest { cmd, addr, port }
    }

    /// Return the command the client asked for.
    pub fn cmd(&self) -> SocksCmd {
        self.cmd
    }
    /// Return the destination address.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }
    /// Return the destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build the proxy's reply to this request.
    ///
    /// `bound` is the address the proxy has bound on the client's behalf
    /// (meaningful for UDP ASSOCIATE); when absent, the all-zero address
    /// is sent, as clients expect from a plain CONNECT.
    pub fn reply(&self, status: SocksStatus, bound: Option<SocketAddr>) -> Vec<u8> {
        let bound = bound.unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        let mut out = Vec::with_capacity(22);
        out.write_u8(5);
        out.write_u8(status.into());
        out.write_u8(0);
        // Infallible: an IP address always encodes.
        let _ = out.write(&SocksAddr::Ip(bound.ip()));
        out.write_u16(bound.port());
        out
    }
}

/// The header prefixed to every datagram relayed over a UDP ASSOCIATE
/// session, in both directions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    /// Fragment number.  We never fragment; relayed datagrams carry zero.
    pub frag: u8,
    /// Datagram destination (client to proxy) or source (proxy to client).
    pub addr: SocksAddr,
    /// Port going with `addr`.
    pub port: u16,
}

impl UdpHeader {
    /// Split one relayed datagram into its header and payload.
    pub fn decode(dgram: &[u8]) -> Result<(UdpHeader, &[u8])> {
        let mut r = Reader::from_slice(dgram);
        if r.take_u16()? != 0 {
            return Err(Error::Syntax);
        }
        let frag = r.take_u8()?;
        let addr = r.extract()?;
        let port = r.take_u16()?;
        let payload = r.into_rest();
        Ok((UdpHeader { frag, addr, port }, payload))
    }

    /// Prefix `payload` with this header, producing the datagram to relay.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + payload.len());
        out.write_u16(0);
        out.write_u8(self.frag);
        // Infallible unless the hostname is oversized, which a header we
        // built ourselves never is.
        let _ = out.write(&self.addr);
        out.write_u16(self.port);
        out.write_all(payload);
        out
    }

    /// Build the header for a datagram flowing back to the client from
    /// `orig`.
    pub fn for_reply(orig: SocketAddr) -> UdpHeader {
        UdpHeader {
            frag: 0,
            addr: SocksAddr::Ip(orig.ip()),
            port: orig.port(),
        }
    }
}
