//! Peer descriptors: how one peer names another on the wire.

use std::net::SocketAddr;

use murk_bytes::{EncodeResult, Readable, Reader, Result, Writeable, Writer};

use crate::PeerId;

/// Capability flags advertised by a peer.
///
/// Stored as a single byte on the wire and in the exit-node cache.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct PeerFlags(u8);

impl PeerFlags {
    /// The peer is willing to relay circuit traffic.
    pub const RELAY: PeerFlags = PeerFlags(1);
    /// The peer is willing to exit BitTorrent traffic to the Internet.
    pub const EXIT_BT: PeerFlags = PeerFlags(1 << 1);

    /// Construct a flags value from its byte representation.
    pub fn from_byte(b: u8) -> Self {
        PeerFlags(b)
    }
    /// Return the byte representation of these flags.
    pub fn as_byte(self) -> u8 {
        self.0
    }
    /// Return true if every flag in `other` is also set in `self`.
    pub fn contains(self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }
    /// Return the union of two flag sets.
    pub fn union(self, other: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for PeerFlags {
    type Output = PeerFlags;
    fn bitor(self, rhs: PeerFlags) -> PeerFlags {
        self.union(rhs)
    }
}

impl std::fmt::Debug for PeerFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(PeerFlags::RELAY) {
            names.push("relay");
        }
        if self.contains(PeerFlags::EXIT_BT) {
            names.push("exit-bt");
        }
        write!(f, "PeerFlags[{}]", names.join("|"))
    }
}

impl Readable for PeerFlags {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(PeerFlags(r.take_u8()?))
    }
}
impl Writeable for PeerFlags {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.0);
        Ok(())
    }
}

/// Everything needed to use a peer as a circuit hop.
///
/// Descriptors come from the bootstrap configuration, from the DHT, and
/// from EXTEND cells; the identity in `id` is what the hop handshake
/// authenticates against.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeerDescriptor {
    /// The peer's identity.
    pub id: PeerId,
    /// The peer's overlay UDP address.
    pub addr: SocketAddr,
    /// The peer's public tunnel (X25519) key.
    pub tunnel_key: [u8; 32],
    /// Capabilities the peer advertises.
    pub flags: PeerFlags,
}

impl PeerDescriptor {
    /// Return true if this peer advertises the relay capability.
    pub fn is_relay(&self) -> bool {
        self.flags.contains(PeerFlags::RELAY)
    }
    /// Return true if this peer advertises the BitTorrent exit capability.
    pub fn is_exit(&self) -> bool {
        self.flags.contains(PeerFlags::EXIT_BT)
    }
}

impl Readable for PeerDescriptor {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let id = r.extract()?;
        let addr = r.extract()?;
        let tunnel_key = r.extract()?;
        let flags = r.extract()?;
        Ok(PeerDescriptor {
            id,
            addr,
            tunnel_key,
            flags,
        })
    }
}
impl Writeable for PeerDescriptor {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.id)?;
        w.write(&self.addr)?;
        w.write(&self.tunnel_key)?;
        w.write(&self.flags)?;
        Ok(())
    }
}
