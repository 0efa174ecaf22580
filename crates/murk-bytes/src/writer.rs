//! Declare the Writer trait.

use crate::{EncodeResult, Writeable};

/// A byte-oriented trait for writing to small in-memory buffers.
///
/// Most code will want to use the fact that `Vec<u8>` implements this
/// trait.  To define a new implementation, just define `write_all`.
///
/// # Example
///
/// ```
/// use murk_bytes::Writer;
/// let mut w: Vec<u8> = Vec::new();
/// w.write_u32(0x12345);
/// w.write_u8(0x22);
/// assert_eq!(w, &[0x00, 0x01, 0x23, 0x45, 0x22]);
/// ```
pub trait Writer {
    /// Append a slice to the end of this writer.
    fn write_all(&mut self, b: &[u8]);

    /// Append a single u8 to this writer.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x]);
    }
    /// Append a single u16 to this writer, encoded in big-endian order.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_be_bytes());
    }
    /// Append a single u32 to this writer, encoded in big-endian order.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_be_bytes());
    }
    /// Append a single u64 to this writer, encoded in big-endian order.
    fn write_u64(&mut self, x: u64) {
        self.write_all(&x.to_be_bytes());
    }
    /// Write `n` zero bytes to this writer.
    fn write_zeros(&mut self, n: usize) {
        let v = vec![0_u8; n];
        self.write_all(&v[..]);
    }
    /// Encode a [`Writeable`] object onto this writer, using its
    /// `write_onto` method.
    fn write<E: Writeable + ?Sized>(&mut self, e: &E) -> EncodeResult<()> {
        e.write_onto(self)
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, b: &[u8]) {
        self.extend_from_slice(b);
    }
}
