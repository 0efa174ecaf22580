//! Fixed-size identifiers used throughout the murk wire protocol.

use murk_bytes::{EncodeResult, Readable, Reader, Result, Writeable, Writer};
use rand::{CryptoRng, Rng};

/// Length in bytes of a [`PeerId`], [`ServiceId`], or [`RendCookie`].
pub const ID_LEN: usize = 20;

/// Helper: declare a 20-byte opaque identifier type.
macro_rules! define_id {
    { $(#[$meta:meta])* $name:ident } => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Wrap a byte array as an identifier of this type.
            pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
            /// Return a reference to the bytes of this identifier.
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;
            fn try_from(bytes: &[u8]) -> std::result::Result<Self, Self::Error> {
                Ok(Self(bytes.try_into()?))
            }
        }

        impl Readable for $name {
            fn take_from(r: &mut Reader<'_>) -> Result<Self> {
                Ok(Self(r.extract()?))
            }
        }

        impl Writeable for $name {
            fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
                w.write_all(&self.0[..]);
                Ok(())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // An abbreviated form is enough to tell peers apart in logs.
                write!(f, "{}({:02x}{:02x}{:02x}{:02x}…)",
                       stringify!($name), self.0[0], self.0[1], self.0[2], self.0[3])
            }
        }
    };
}

define_id! {
    /// The identity of a peer on the murk overlay.
    ///
    /// Derived from the peer's public tunnel key; collision-free in
    /// practice.
    PeerId
}

define_id! {
    /// The identity of a hidden service (in practice, a content infohash).
    ServiceId
}

define_id! {
    /// A one-time cookie binding the two halves of a rendezvous together.
    ///
    /// Chosen randomly by the downloader; a rendezvous point accepts at
    /// most one RENDEZVOUS1 per cookie.
    RendCookie
}

impl RendCookie {
    /// Choose a new random cookie.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0_u8; ID_LEN];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn display_is_hex() {
        let id = PeerId::from_bytes([0xab; 20]);
        assert_eq!(id.to_string(), "ab".repeat(20));
    }

    #[test]
    fn exported_length_matches_the_types() {
        let id = PeerId::from_bytes([0; crate::ID_LEN]);
        assert_eq!(id.as_bytes().len(), crate::ID_LEN);
    }

    #[test]
    fn wire_round_trip() {
        let cookie = RendCookie::from_bytes(*b"twenty bytes exactly");
        let mut v: Vec<u8> = Vec::new();
        v.write(&cookie).unwrap();
        assert_eq!(v.len(), ID_LEN);
        let mut r = Reader::from_slice(&v);
        let back: RendCookie = r.extract().unwrap();
        assert_eq!(back, cookie);
    }

    #[test]
    fn random_cookies_differ() {
        let mut rng = rand::thread_rng();
        let a = RendCookie::random(&mut rng);
        let b = RendCookie::random(&mut rng);
        assert_ne!(a, b);
    }
}
