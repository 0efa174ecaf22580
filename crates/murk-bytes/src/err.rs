//! Error types for decoding and encoding.

use thiserror::Error;

/// Error type for decoding murk objects from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to read something, but there were not enough bytes left.
    ///
    /// Cells arrive one per datagram, so a truncated object means the
    /// sender framed it wrong: there is never "more" to wait for.
    #[error("object truncated")]
    Truncated,
    /// Called [`Reader::should_be_exhausted`](crate::Reader::should_be_exhausted),
    /// but bytes remained.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// A length field declared a length that cannot be honored.
    #[error("declared object length invalid")]
    BadLengthValue,
    /// The bytes were present but their contents were not acceptable.
    #[error("bad object: {0}")]
    BadMessage(&'static str),
}

/// Error type for encoding murk objects to bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EncodeError {
    /// Tried to encode a variable-length object whose length does not fit
    /// in its length field.
    #[error("object length too large to encode")]
    BadLengthValue,
    /// Tried to encode an object that cannot be represented in this format.
    #[error("cannot encode: {0}")]
    NotRepresentable(&'static str),
}
