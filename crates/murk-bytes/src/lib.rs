//! Low-level byte parsing and encoding for the murk wire protocols.
//!
//! # Overview
//!
//! Every codec in murk (cells, SOCKS messages, handshake bodies) works on
//! small in-memory buffers: one UDP datagram, one handshake record.  This
//! crate provides the [`Reader`] and [`Writer`] types they share, along
//! with the [`Readable`] and [`Writeable`] traits that let message types
//! describe their own encodings.
//!
//! All multi-byte integers are big-endian, as everywhere else in the murk
//! wire format.
//!
//! Unlike `std::io`, nothing here blocks and nothing here is fallible in
//! surprising ways: a [`Reader`] fails only by running out of bytes or by
//! finding bytes it cannot accept, and a [`Writer`] fails only when asked
//! to encode a length that does not fit its field.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]

mod err;
mod reader;
mod writer;

pub use err::{EncodeError, Error};
pub use reader::Reader;
pub use writer::Writer;

/// Result type returned by this crate for [`Reader`]-related methods.
pub type Result<T> = std::result::Result<T, Error>;
/// Result type returned by this crate for [`Writer`]-related methods.
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

/// Trait for an object that can be decoded from a [`Reader`].
///
/// Most code won't call [`Readable::take_from`] directly, but will instead
/// use it implicitly via [`Reader::extract`].
pub trait Readable: Sized {
    /// Try to extract an object of this type from `r`.
    ///
    /// Implementations should consume exactly the bytes that encode the
    /// object, and no more: callers rely on the reader's position
    /// afterwards.
    fn take_from(r: &mut Reader<'_>) -> Result<Self>;
}

/// Trait for an object that can be encoded onto a [`Writer`].
///
/// Most code won't call [`Writeable::write_onto`] directly, but will
/// instead use it implicitly via [`Writer::write`].
pub trait Writeable {
    /// Encode this object onto `w`.
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()>;
}

impl<W: Writeable + ?Sized> Writeable for &W {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        (*self).write_onto(b)
    }
}

// Integers are always big-endian on the wire.

impl Readable for u8 {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        r.take_u8()
    }
}
impl Readable for u16 {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        r.take_u16()
    }
}
impl Readable for u32 {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        r.take_u32()
    }
}
impl Readable for u64 {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        r.take_u64()
    }
}

impl Writeable for u8 {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(*self);
        Ok(())
    }
}
impl Writeable for u16 {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u16(*self);
        Ok(())
    }
}
impl Writeable for u32 {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(*self);
        Ok(())
    }
}
impl Writeable for u64 {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(*self);
        Ok(())
    }
}

impl<const N: usize> Readable for [u8; N] {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let bytes = r.take(N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

impl<const N: usize> Writeable for [u8; N] {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self[..]);
        Ok(())
    }
}

impl Writeable for [u8] {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_all(self);
        Ok(())
    }
}

impl Readable for std::net::Ipv4Addr {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(r.take_u32()?.into())
    }
}
impl Writeable for std::net::Ipv4Addr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u32((*self).into());
        Ok(())
    }
}
impl Readable for std::net::Ipv6Addr {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let octets: [u8; 16] = r.extract()?;
        Ok(octets.into())
    }
}
impl Writeable for std::net::Ipv6Addr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.octets());
        Ok(())
    }
}

// Socket addresses are encoded as a family tag (4 or 6), the address
// octets, and a big-endian port.
impl Readable for std::net::SocketAddr {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let fam = r.take_u8()?;
        let ip: std::net::IpAddr = match fam {
            4 => r.extract::<std::net::Ipv4Addr>()?.into(),
            6 => r.extract::<std::net::Ipv6Addr>()?.into(),
            _ => return Err(Error::BadMessage("unrecognized address family")),
        };
        let port = r.take_u16()?;
        Ok(std::net::SocketAddr::new(ip, port))
    }
}
impl Writeable for std::net::SocketAddr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        match self.ip() {
            std::net::IpAddr::V4(ip) => {
                w.write_u8(4);
                w.write(&ip)?;
            }
            std::net::IpAddr::V6(ip) => {
                w.write_u8(6);
                w.write(&ip)?;
            }
        }
        w.write_u16(self.port());
        Ok(())
    }
}
