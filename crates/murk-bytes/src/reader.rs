//! Declare the Reader type.

use crate::{Error, Readable, Result};

/// A type for decoding messages from a slice of bytes.
///
/// Unlike `io::Read`, this object has a simple error type and works only
/// on in-memory buffers.  It keeps a cursor into the slice; every `take_*`
/// method advances the cursor or fails without consuming anything.
///
/// # Example
///
/// ```
/// use murk_bytes::Reader;
/// let msg = [0x00, 0x01, 0x23, 0x45, 0x22];
/// let mut r = Reader::from_slice(&msg[..]);
/// assert_eq!(r.take_u32()?, 0x12345);
/// assert_eq!(r.take_u8()?, 0x22);
/// r.should_be_exhausted()?;
/// # murk_bytes::Result::Ok(())
/// ```
pub struct Reader<'a> {
    /// The underlying slice being read.
    b: &'a [u8],
    /// The next position in the slice to read from.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader from a slice of bytes.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }

    /// Return the total length of the underlying slice.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }

    /// Return the number of bytes that have not yet been read.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }

    /// Return the number of bytes that have already been read.
    pub fn consumed(&self) -> usize {
        self.off
    }

    /// Consume this reader and return the remaining unread bytes.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }

    /// Take all remaining bytes, leaving the reader exhausted.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.b[self.off..];
        self.off = self.b.len();
        rest
    }

    /// Skip `n` bytes, or fail with [`Error::Truncated`] if there are
    /// fewer than `n` left.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        let _ = self.peek(n)?;
        self.off += n;
        Ok(())
    }

    /// Check whether this reader is exhausted; fail with
    /// [`Error::ExtraneousBytes`] if it is not.
    ///
    /// Cell bodies must consume their datagram exactly, so decoders call
    /// this after parsing.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ExtraneousBytes);
        }
        Ok(())
    }

    /// Return the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated);
        }
        Ok(&self.b[self.off..self.off + n])
    }

    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self.peek(n)?;
        self.off += n;
        Ok(bytes)
    }

    /// Consume and return a single byte.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    /// Consume and return a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes(b.try_into().map_err(|_| Error::Truncated)?))
    }

    /// Consume and return a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes(b.try_into().map_err(|_| Error::Truncated)?))
    }

    /// Consume and return a big-endian u64.
    pub fn take_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().map_err(|_| Error::Truncated)?))
    }

    /// Consume and return the next `n` bytes as a vector.
    pub fn take_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Consume a u8 length field followed by that many bytes.
    pub fn take_u8_prefixed(&mut self) -> Result<&'a [u8]> {
        let n = self.take_u8()? as usize;
        self.take(n)
    }

    /// Consume a big-endian u16 length field followed by that many bytes.
    pub fn take_u16_prefixed(&mut self) -> Result<&'a [u8]> {
        let n = self.take_u16()? as usize;
        self.take(n)
    }

    /// Decode an object of type `E` from this reader.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        E::take_from(self)
    }
}
