//! Typed bodies for the different kinds of cells.
//!
//! A body here describes a cell payload *after* any layered encryption has
//! been removed: link-level cells carry these bodies directly, and circuit
//! cells carry them once the receiving endpoint has peeled its layers.

use std::net::SocketAddr;

use murk_bytes::{EncodeResult, Reader, Result, Writer};

use crate::{CellCmd, CircId, PeerDescriptor, RawCell, RendCookie, ServiceId};

/// Trait for the bodies of cells.
pub trait Body: Sized {
    /// Decode a cell body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self>;
    /// Consume this message and encode its body onto `w`.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>;
}

/// Ask a peer to become the first hop of a new circuit.
///
/// The payload is the originator's half of the hop key exchange, and is
/// forwarded verbatim when this CREATE was prompted by an EXTEND.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Create {
    /// Client half of the hop handshake.
    pub handshake: Vec<u8>,
}
impl Body for Create {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Create {
            handshake: r.take_rest().to_vec(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// Answer a CREATE cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Created {
    /// Server half of the hop handshake.
    pub handshake: Vec<u8>,
}
impl Body for Created {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Created {
            handshake: r.take_rest().to_vec(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// Ask the terminal hop of a circuit to extend it to `peer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extend {
    /// The peer to extend to.
    pub peer: PeerDescriptor,
    /// Client half of the hop handshake, opaque to the extending relay.
    pub handshake: Vec<u8>,
}
impl Body for Extend {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let peer = r.extract()?;
        let handshake = r.take_rest().to_vec();
        Ok(Extend { peer, handshake })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.peer)?;
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// Answer an EXTEND cell: the new hop's handshake reply, relayed inward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extended {
    /// Server half of the hop handshake.
    pub handshake: Vec<u8>,
}
impl Body for Extended {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Extended {
            handshake: r.take_rest().to_vec(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// Tunneled traffic.
///
/// Outbound, `dest` is where the exit should send the payload and `orig`
/// is unset.  Inbound, `orig` is where the payload came from and `dest`
/// is unset.  "Unset" is the all-zero IPv4 address and port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    /// Where the payload is going.
    pub dest: SocketAddr,
    /// Where the payload came from.
    pub orig: SocketAddr,
    /// The tunneled bytes.
    pub payload: Vec<u8>,
}
impl Data {
    /// The "unset" address used for the unused direction field.
    pub fn unset_addr() -> SocketAddr {
        SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
    }
}
impl Body for Data {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let dest = r.extract()?;
        let orig = r.extract()?;
        let payload = r.take_rest().to_vec();
        Ok(Data {
            dest,
            orig,
            payload,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.dest)?;
        w.write(&self.orig)?;
        w.write_all(&self.payload);
        Ok(())
    }
}

/// Declared reason for tearing down a circuit.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DestroyReason(u8);

impl DestroyReason {
    /// No reason given.
    pub const NONE: DestroyReason = DestroyReason(0);
    /// The peer saw a protocol violation.
    pub const PROTOCOL: DestroyReason = DestroyReason(1);
    /// Internal error at the sending peer.
    pub const INTERNAL: DestroyReason = DestroyReason(2);
    /// The circuit owner retired the circuit.
    pub const REQUESTED: DestroyReason = DestroyReason(3);
    /// The peer ran out of sockets, memory, or circuit ids.
    pub const RESOURCE_LIMIT: DestroyReason = DestroyReason(4);
    /// The next hop could not be reached.
    pub const CONNECT_FAILED: DestroyReason = DestroyReason(5);
    /// The circuit reached its maximum age.
    pub const FINISHED: DestroyReason = DestroyReason(6);
    /// Circuit construction took too long.
    pub const TIMEOUT: DestroyReason = DestroyReason(7);

    /// Return a human-readable string for this reason.
    pub fn human_str(&self) -> &'static str {
        match *self {
            DestroyReason::NONE => "no reason",
            DestroyReason::PROTOCOL => "protocol violation",
            DestroyReason::INTERNAL => "internal error",
            DestroyReason::REQUESTED => "retired by owner",
            DestroyReason::RESOURCE_LIMIT => "peer out of resources",
            DestroyReason::CONNECT_FAILED => "could not reach next hop",
            DestroyReason::FINISHED => "circuit expired",
            DestroyReason::TIMEOUT => "construction timed out",
            _ => "unrecognized reason",
        }
    }
}
impl From<u8> for DestroyReason {
    fn from(b: u8) -> Self {
        DestroyReason(b)
    }
}
impl From<DestroyReason> for u8 {
    fn from(r: DestroyReason) -> u8 {
        r.0
    }
}
impl std::fmt::Debug for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DestroyReason({}: {})", self.0, self.human_str())
    }
}

/// Tear down a circuit.
///
/// Travels in the clear: every relay along the circuit processes it and
/// forwards a fresh copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destroy {
    /// Why the circuit is being torn down.
    pub reason: DestroyReason,
}
impl Destroy {
    /// Create a new destroy message.
    pub fn new(reason: DestroyReason) -> Self {
        Destroy { reason }
    }
}
impl Body for Destroy {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Destroy {
            reason: r.take_u8()?.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.reason.into());
        Ok(())
    }
}

/// Liveness probe.  With no circuit id it checks a candidate peer; with a
/// circuit id it checks the whole circuit out to its terminal hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    /// Random value echoed back in the matching PONG.
    pub nonce: u64,
}
impl Body for Ping {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Ping {
            nonce: r.take_u64()?,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(self.nonce);
        Ok(())
    }
}

/// Answer to a PING.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    /// The nonce from the PING being answered.
    pub nonce: u64,
}
impl Body for Pong {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Pong {
            nonce: r.take_u64()?,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(self.nonce);
        Ok(())
    }
}

/// Ask the terminal hop of this circuit to act as an introduction point
/// for a hidden service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EstablishIntro {
    /// The service being advertised.
    pub service: ServiceId,
    /// The service's public key; INTRODUCE1 payloads are sealed to it.
    pub auth_key: [u8; 32],
}
impl Body for EstablishIntro {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let service = r.extract()?;
        let auth_key = r.extract()?;
        Ok(EstablishIntro { service, auth_key })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.service)?;
        w.write(&self.auth_key)?;
        Ok(())
    }
}

/// Acknowledge an ESTABLISH_INTRO.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntroEstablished {}
impl Body for IntroEstablished {
    fn decode_from_reader(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(IntroEstablished {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// Ask the terminal hop of this circuit to act as a rendezvous point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EstablishRendezvous {
    /// Fresh cookie that the seeder's RENDEZVOUS1 must present.
    pub cookie: RendCookie,
}
impl Body for EstablishRendezvous {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(EstablishRendezvous {
            cookie: r.extract()?,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.cookie)
    }
}

/// Acknowledge an ESTABLISH_RENDEZVOUS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RendezvousEstablished {}
impl Body for RendezvousEstablished {
    fn decode_from_reader(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(RendezvousEstablished {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// Introduction request, sent by a downloader to an introduction point.
///
/// The sealed part can only be opened by the hidden service itself; the
/// introduction point learns nothing but the service id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Introduce1 {
    /// Which service this introduction is for.
    pub service: ServiceId,
    /// Payload sealed to the service's public key.
    pub sealed: Vec<u8>,
}
impl Body for Introduce1 {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let service = r.extract()?;
        let sealed = r.take_rest().to_vec();
        Ok(Introduce1 { service, sealed })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.service)?;
        w.write_all(&self.sealed);
        Ok(())
    }
}

/// Introduction request as forwarded from the introduction point to the
/// seeder.  Same shape as INTRODUCE1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Introduce2 {
    /// Which service this introduction is for.
    pub service: ServiceId,
    /// Payload sealed to the service's public key.
    pub sealed: Vec<u8>,
}
impl Body for Introduce2 {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let service = r.extract()?;
        let sealed = r.take_rest().to_vec();
        Ok(Introduce2 { service, sealed })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.service)?;
        w.write_all(&self.sealed);
        Ok(())
    }
}

impl From<Introduce1> for Introduce2 {
    fn from(i: Introduce1) -> Self {
        Introduce2 {
            service: i.service,
            sealed: i.sealed,
        }
    }
}

/// Rendezvous completion, sent by the seeder to the rendezvous point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendezvous1 {
    /// Cookie matching a pending ESTABLISH_RENDEZVOUS.
    pub cookie: RendCookie,
    /// The seeder's half of the end-to-end key exchange.
    pub handshake: Vec<u8>,
}
impl Body for Rendezvous1 {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let cookie = r.extract()?;
        let handshake = r.take_rest().to_vec();
        Ok(Rendezvous1 { cookie, handshake })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.cookie)?;
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// Rendezvous completion as forwarded to the downloader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendezvous2 {
    /// The seeder's half of the end-to-end key exchange.
    pub handshake: Vec<u8>,
}
impl Body for Rendezvous2 {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Rendezvous2 {
            handshake: r.take_rest().to_vec(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// Ask the terminal hop to perform one TCP request/response exchange with
/// `dest` on the requester's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    /// Matches the response to the request at the originator.
    pub request_id: u32,
    /// The TCP endpoint to talk to.
    pub dest: SocketAddr,
    /// Bytes to send once connected.
    pub request: Vec<u8>,
}
impl Body for HttpRequest {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let request_id = r.take_u32()?;
        let dest = r.extract()?;
        let request = r.take_rest().to_vec();
        Ok(HttpRequest {
            request_id,
            dest,
            request,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.request_id);
        w.write(&self.dest)?;
        w.write_all(&self.request);
        Ok(())
    }
}

/// Answer to an HTTP_REQUEST.  An empty response is a valid response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// The id of the request being answered.
    pub request_id: u32,
    /// Bytes read back from the TCP endpoint.
    pub response: Vec<u8>,
}
impl Body for HttpResponse {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let request_id = r.take_u32()?;
        let response = r.take_rest().to_vec();
        Ok(HttpResponse {
            request_id,
            response,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.request_id);
        w.write_all(&self.response);
        Ok(())
    }
}

/// Helper: declare the AnyMsg enum and its command dispatch in one place.
macro_rules! decl_any_msg {
    { $( $cmd:ident => $variant:ident ),* $(,)? } => {
        /// A decoded cell body of any recognized kind.
        #[derive(Clone, Debug, PartialEq, Eq)]
        #[non_exhaustive]
        pub enum AnyMsg {
            $(
                #[doc = concat!("A ", stringify!($cmd), " body.")]
                $variant($variant),
            )*
        }

        $(
            impl From<$variant> for AnyMsg {
                fn from(m: $variant) -> AnyMsg {
                    AnyMsg::$variant(m)
                }
            }
        )*

        impl AnyMsg {
            /// Return the command value that labels this body on the wire.
            pub fn cmd(&self) -> CellCmd {
                match self {
                    $( AnyMsg::$variant(_) => CellCmd::$cmd, )*
                }
            }

            /// Decode a body of the kind labelled by `cmd`.
            pub fn decode_from_reader(cmd: CellCmd, r: &mut Reader<'_>) -> Result<Self> {
                match cmd {
                    $( CellCmd::$cmd => Ok(AnyMsg::$variant($variant::decode_from_reader(r)?)), )*
                    _ => Err(murk_bytes::Error::BadMessage("unrecognized cell command")),
                }
            }

            /// Consume this message and encode its body onto `w`.
            pub fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
                match self {
                    $( AnyMsg::$variant(m) => m.encode_onto(w), )*
                }
            }
        }
    };
}

decl_any_msg! {
    CREATE => Create,
    CREATED => Created,
    EXTEND => Extend,
    EXTENDED => Extended,
    DATA => Data,
    DESTROY => Destroy,
    PING => Ping,
    PONG => Pong,
    ESTABLISH_INTRO => EstablishIntro,
    INTRO_ESTABLISHED => IntroEstablished,
    ESTABLISH_RENDEZVOUS => EstablishRendezvous,
    RENDEZVOUS_ESTABLISHED => RendezvousEstablished,
    INTRODUCE1 => Introduce1,
    INTRODUCE2 => Introduce2,
    RENDEZVOUS1 => Rendezvous1,
    RENDEZVOUS2 => Rendezvous2,
    HTTP_REQUEST => HttpRequest,
    HTTP_RESPONSE => HttpResponse,
}

impl AnyMsg {
    /// Decode a complete cleartext payload into a body.
    ///
    /// Fails if the body does not consume the payload exactly: cells
    /// arrive one per datagram, so trailing bytes mean a framing bug or a
    /// forgery.
    pub fn decode_payload(cmd: CellCmd, payload: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(payload);
        let msg = Self::decode_from_reader(cmd, &mut r)?;
        r.should_be_exhausted()?;
        Ok(msg)
    }

    /// Encode this body into a payload vector.
    pub fn encode_payload(self) -> EncodeResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_onto(&mut out)?;
        Ok(out)
    }

    /// Wrap this body in a cell with a cleartext payload.
    pub fn into_cell(self, circ: Option<CircId>) -> EncodeResult<RawCell> {
        let cmd = self.cmd();
        Ok(RawCell::new(circ, cmd, self.encode_payload()?))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{PeerFlags, PeerId};
    use hex_literal::hex;

    fn round_trip(msg: AnyMsg) {
        let cmd = msg.cmd();
        let payload = msg.clone().encode_payload().unwrap();
        let back = AnyMsg::decode_payload(cmd, &payload).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn handshake_bodies() {
        round_trip(Create { handshake: vec![1, 2, 3] }.into());
        round_trip(Created { handshake: vec![] }.into());
        round_trip(
            Extend {
                peer: PeerDescriptor {
                    id: PeerId::from_bytes([9; 20]),
                    addr: "192.0.2.1:4000".parse().unwrap(),
                    tunnel_key: [3; 32],
                    flags: PeerFlags::RELAY,
                },
                handshake: vec![0xaa; 32],
            }
            .into(),
        );
        round_trip(Extended { handshake: vec![0xbb; 64] }.into());
    }

    #[test]
    fn data_wire_format() {
        let msg = Data {
            dest: "192.0.2.5:80".parse().unwrap(),
            orig: Data::unset_addr(),
            payload: b"hello".to_vec(),
        };
        let payload = AnyMsg::from(msg.clone()).encode_payload().unwrap();
        assert_eq!(
            payload,
            hex!(
                "04 c0000205 0050" // dest: 192.0.2.5:80
                "04 00000000 0000" // orig: unset
                "68656c6c6f"       // "hello"
            )
        );
        round_trip(msg.into());
    }

    #[test]
    fn control_bodies() {
        round_trip(Destroy::new(DestroyReason::TIMEOUT).into());
        round_trip(Ping { nonce: 7 }.into());
        round_trip(Pong { nonce: 7 }.into());
        assert_eq!(DestroyReason::from(200).human_str(), "unrecognized reason");
    }

    #[test]
    fn rendezvous_bodies() {
        let service = ServiceId::from_bytes([1; 20]);
        let cookie = RendCookie::from_bytes(*b"\xde\xad\xbe\xef cookie bytes...");
        round_trip(EstablishIntro { service, auth_key: [5; 32] }.into());
        round_trip(IntroEstablished {}.into());
        round_trip(EstablishRendezvous { cookie }.into());
        round_trip(RendezvousEstablished {}.into());
        round_trip(Introduce1 { service, sealed: vec![9; 40] }.into());
        round_trip(Introduce2 { service, sealed: vec![9; 40] }.into());
        round_trip(Rendezvous1 { cookie, handshake: vec![2; 64] }.into());
        round_trip(Rendezvous2 { handshake: vec![2; 64] }.into());
    }

    #[test]
    fn http_bodies() {
        round_trip(
            HttpRequest {
                request_id: 77,
                dest: "198.51.100.1:8080".parse().unwrap(),
                request: b"GET / HTTP/1.0\r\n\r\n".to_vec(),
            }
            .into(),
        );
        round_trip(HttpResponse { request_id: 77, response: vec![] }.into());
    }

    #[test]
    fn trailing_bytes_rejected() {
        // A PING is eight bytes of nonce; a ninth byte is an error.
        let bad = hex!("00000000 00000007 ff");
        assert!(AnyMsg::decode_payload(CellCmd::PING, &bad).is_err());
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(AnyMsg::decode_payload(CellCmd::from(250), &[]).is_err());
    }

    #[test]
    fn into_cell_sets_cmd() {
        let cell = AnyMsg::from(Ping { nonce: 1 })
            .into_cell(CircId::new(9))
            .unwrap();
        assert_eq!(cell.cmd(), CellCmd::PING);
        assert_eq!(cell.circ(), CircId::new(9));
    }
}
