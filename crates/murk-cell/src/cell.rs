//! The cell frame: circuit id, command, flags, payload.

use std::num::NonZeroU32;

use murk_bytes::{Error, Reader, Result, Writer};

/// Length of the fixed cell header: circuit id (4), command (1), flags (1).
pub const CELL_HEADER_LEN: usize = 6;

/// Identifier for a circuit, local to one peer and one direction.
///
/// Cannot be zero: a cell with a zero circuit id field is a link-level
/// cell, addressed to the receiving peer itself rather than to a circuit.
/// For an "optional" circuit id, use `Option<CircId>`.
///
/// The same numerical id used by two different peers names two different
/// circuits; only the pair (peer, id) is globally unique.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct CircId(NonZeroU32);

impl From<NonZeroU32> for CircId {
    fn from(item: NonZeroU32) -> Self {
        Self(item)
    }
}
impl From<CircId> for u32 {
    fn from(id: CircId) -> u32 {
        id.0.get()
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl CircId {
    /// Creates a `CircId` for non-zero `val`; `None` when `val` is zero.
    pub fn new(val: u32) -> Option<Self> {
        NonZeroU32::new(val).map(Self)
    }

    /// Convenience function to convert to a `u32`; `None` is mapped to 0.
    pub fn get_or_zero(circ_id: Option<Self>) -> u32 {
        match circ_id {
            Some(circ_id) => circ_id.0.get(),
            None => 0,
        }
    }
}

/// The command byte of a cell: what kind of cell this is.
///
/// Cells whose command we do not recognize still parse as [`RawCell`]s,
/// so that a relay can refuse them explicitly rather than by accident.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CellCmd(u8);

impl CellCmd {
    /// Ask a peer to become the first hop of a new circuit.
    pub const CREATE: CellCmd = CellCmd(1);
    /// Answer a CREATE cell, completing the hop handshake.
    pub const CREATED: CellCmd = CellCmd(2);
    /// Ask the terminal hop of a circuit to extend it by one peer.
    pub const EXTEND: CellCmd = CellCmd(3);
    /// Answer an EXTEND cell, carrying the new hop's handshake reply.
    pub const EXTENDED: CellCmd = CellCmd(4);
    /// Carry tunneled traffic along a circuit.
    pub const DATA: CellCmd = CellCmd(5);
    /// Tear down a circuit.
    pub const DESTROY: CellCmd = CellCmd(6);
    /// Liveness probe, either link-level or along a circuit.
    pub const PING: CellCmd = CellCmd(7);
    /// Answer to a PING.
    pub const PONG: CellCmd = CellCmd(8);

    /// Ask the terminal hop to become an introduction point.
    pub const ESTABLISH_INTRO: CellCmd = CellCmd(20);
    /// Acknowledge an ESTABLISH_INTRO.
    pub const INTRO_ESTABLISHED: CellCmd = CellCmd(21);
    /// Ask the terminal hop to become a rendezvous point.
    pub const ESTABLISH_RENDEZVOUS: CellCmd = CellCmd(22);
    /// Acknowledge an ESTABLISH_RENDEZVOUS.
    pub const RENDEZVOUS_ESTABLISHED: CellCmd = CellCmd(23);
    /// Introduction request, from downloader to introduction point.
    pub const INTRODUCE1: CellCmd = CellCmd(24);
    /// Introduction request, forwarded to the hidden-service seeder.
    pub const INTRODUCE2: CellCmd = CellCmd(25);
    /// Rendezvous completion, from seeder to rendezvous point.
    pub const RENDEZVOUS1: CellCmd = CellCmd(26);
    /// Rendezvous completion, forwarded to the downloader.
    pub const RENDEZVOUS2: CellCmd = CellCmd(27);

    /// Ask the terminal hop to perform one TCP request/response exchange.
    pub const HTTP_REQUEST: CellCmd = CellCmd(40);
    /// Answer to an HTTP_REQUEST.
    pub const HTTP_RESPONSE: CellCmd = CellCmd(41);

    /// Return the raw command value.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Return true if this command's payload travels in the clear between
    /// two directly-linked peers.
    ///
    /// Every other command's payload is protected by the circuit's layered
    /// encryption: relays transform it without interpreting it.
    pub fn is_link_level(self) -> bool {
        matches!(
            self,
            CellCmd::CREATE | CellCmd::CREATED | CellCmd::DESTROY
        )
    }

    /// Return true if this command makes sense without a circuit id.
    ///
    /// Liveness probes are addressed to a peer rather than to a circuit,
    /// and INTRODUCE1 reaches an introduction point from outside any
    /// circuit (delivered by whatever exit the downloader used).
    pub fn accepts_no_circid(self) -> bool {
        matches!(self, CellCmd::PING | CellCmd::PONG | CellCmd::INTRODUCE1)
    }
}

impl From<u8> for CellCmd {
    fn from(cmd: u8) -> Self {
        Self(cmd)
    }
}
impl From<CellCmd> for u8 {
    fn from(cmd: CellCmd) -> u8 {
        cmd.0
    }
}
impl std::fmt::Display for CellCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            CellCmd::CREATE => "CREATE",
            CellCmd::CREATED => "CREATED",
            CellCmd::EXTEND => "EXTEND",
            CellCmd::EXTENDED => "EXTENDED",
            CellCmd::DATA => "DATA",
            CellCmd::DESTROY => "DESTROY",
            CellCmd::PING => "PING",
            CellCmd::PONG => "PONG",
            CellCmd::ESTABLISH_INTRO => "ESTABLISH_INTRO",
            CellCmd::INTRO_ESTABLISHED => "INTRO_ESTABLISHED",
            CellCmd::ESTABLISH_RENDEZVOUS => "ESTABLISH_RENDEZVOUS",
            CellCmd::RENDEZVOUS_ESTABLISHED => "RENDEZVOUS_ESTABLISHED",
            CellCmd::INTRODUCE1 => "INTRODUCE1",
            CellCmd::INTRODUCE2 => "INTRODUCE2",
            CellCmd::RENDEZVOUS1 => "RENDEZVOUS1",
            CellCmd::RENDEZVOUS2 => "RENDEZVOUS2",
            CellCmd::HTTP_REQUEST => "HTTP_REQUEST",
            CellCmd::HTTP_RESPONSE => "HTTP_RESPONSE",
            _ => return write!(f, "<unrecognized {}>", self.0),
        };
        write!(f, "{}", name)
    }
}
impl std::fmt::Debug for CellCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CellCmd({})", self)
    }
}

/// A cell as it appears on the wire: header fields plus an opaque payload.
///
/// One cell travels in exactly one UDP datagram, so the payload length is
/// the datagram length minus the header; there is no length field to
/// disagree with.  A structured payload must consume the datagram exactly
/// when it is later decoded.
///
/// For most commands the payload here is one or more layers of circuit
/// encryption; it only becomes a typed [`msg::AnyMsg`](crate::msg::AnyMsg)
/// once the layers owed to this peer have been removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCell {
    /// Circuit this cell belongs to, or None for a link-level cell.
    circ: Option<CircId>,
    /// What kind of cell this is.
    cmd: CellCmd,
    /// Flags byte; no flags are currently assigned and senders write zero.
    flags: u8,
    /// Payload bytes, possibly still encrypted.
    payload: Vec<u8>,
}

impl RawCell {
    /// Construct a new cell with a zero flags byte.
    pub fn new(circ: Option<CircId>, cmd: CellCmd, payload: Vec<u8>) -> Self {
        RawCell {
            circ,
            cmd,
            flags: 0,
            payload,
        }
    }

    /// Return the circuit id of this cell, if any.
    pub fn circ(&self) -> Option<CircId> {
        self.circ
    }
    /// Return the command of this cell.
    pub fn cmd(&self) -> CellCmd {
        self.cmd
    }
    /// Return the flags byte of this cell.
    pub fn flags(&self) -> u8 {
        self.flags
    }
    /// Return a reference to this cell's payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    /// Consume this cell, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
    /// Replace this cell's payload, keeping the header fields.
    ///
    /// This is what a relay does after removing or adding one layer of
    /// encryption.
    pub fn with_payload(self, payload: Vec<u8>) -> Self {
        RawCell { payload, ..self }
    }

    /// Decode one UDP datagram into a cell.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(datagram);
        let circ = CircId::new(r.take_u32()?);
        let cmd: CellCmd = r.take_u8()?.into();
        let flags = r.take_u8()?;
        if circ.is_none() && !cmd.accepts_no_circid() {
            return Err(Error::BadMessage("cell without circuit id"));
        }
        let payload = r.take_rest().to_vec();
        Ok(RawCell {
            circ,
            cmd,
            flags,
            payload,
        })
    }

    /// Encode this cell into the bytes of one UDP datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CELL_HEADER_LEN + self.payload.len());
        out.write_u32(CircId::get_or_zero(self.circ));
        out.write_u8(self.cmd.into());
        out.write_u8(self.flags);
        out.write_all(&self.payload);
        out
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn frame_round_trip() {
        let circ = CircId::new(42).unwrap();
        let cell = RawCell::new(Some(circ), CellCmd::DATA, b"onions".to_vec());
        let wire = cell.encode();
        assert_eq!(&wire[..CELL_HEADER_LEN], &hex!("0000002a 05 00"));
        assert_eq!(&wire[CELL_HEADER_LEN..], b"onions");
        let back = RawCell::decode(&wire).unwrap();
        assert_eq!(back, cell);
    }

    #[test]
    fn link_cell_without_circid() {
        let wire = hex!("00000000 07 00 0011223344556677");
        let cell = RawCell::decode(&wire).unwrap();
        assert_eq!(cell.circ(), None);
        assert_eq!(cell.cmd(), CellCmd::PING);
        assert_eq!(cell.payload().len(), 8);
    }

    #[test]
    fn zero_circid_requires_link_cmd() {
        // DATA with a zero circuit id is not meaningful.
        let wire = hex!("00000000 05 00 00");
        assert!(RawCell::decode(&wire).is_err());
    }

    #[test]
    fn truncated_header() {
        let wire = hex!("0000002a 05");
        assert_eq!(RawCell::decode(&wire), Err(murk_bytes::Error::Truncated));
    }

    #[test]
    fn empty_payload_is_fine() {
        let wire = hex!("00000001 08 00");
        let cell = RawCell::decode(&wire).unwrap();
        assert!(cell.payload().is_empty());
        assert_eq!(cell.encode(), wire);
    }

    #[test]
    fn cmd_names() {
        assert_eq!(CellCmd::ESTABLISH_RENDEZVOUS.to_string(), "ESTABLISH_RENDEZVOUS");
        assert_eq!(CellCmd::from(99).to_string(), "<unrecognized 99>");
        assert!(CellCmd::CREATE.is_link_level());
        assert!(!CellCmd::DATA.is_link_level());
        assert!(CellCmd::PONG.accepts_no_circid());
        assert!(CellCmd::INTRODUCE1.accepts_no_circid());
        assert!(!CellCmd::EXTEND.accepts_no_circid());
    }
}
