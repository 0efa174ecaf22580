//! Layered encryption: adding and removing onion layers one hop at a time.
//!
//! Every hop on a circuit shares a [`HopLayer`] with the circuit owner.
//! Outbound, the owner seals the payload once per hop, innermost layer
//! belonging to the terminal hop; each relay peels exactly one layer with
//! [`HopLayer::open_outbound`] and passes the rest along.  Inbound the
//! roles reverse.
//!
//! A sealed layer is `seq: u32 BE || ciphertext`, where the ciphertext
//! carries a 16-byte Poly1305 tag.  The sequence number is chosen by
//! whoever seals and consumed from the wire by whoever opens, so a lost
//! datagram costs only itself.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};

use murk_bytes::Reader;

use crate::{Error, HopKeys, Result};

/// Bytes one layer adds to a payload: sequence number plus AEAD tag.
pub const LAYER_OVERHEAD: usize = 4 + 16;

/// One direction of one hop's layer.
struct LayerCipher {
    /// The AEAD keyed for this direction.
    aead: ChaCha20Poly1305,
    /// Sequence number the next sealed payload will carry.
    seq: u32,
}

impl LayerCipher {
    /// Set up a direction cipher from its key.
    fn new(key: &[u8; 32]) -> Self {
        LayerCipher {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            seq: 0,
        }
    }

    /// Build the nonce for sequence number `seq`.
    ///
    /// Each direction has its own key and uses each sequence number at
    /// most once, so every (key, nonce) pair here is unique.
    fn nonce(seq: u32) -> Nonce {
        let mut nonce = Nonce::default();
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Add this layer to `plain`, advancing the sequence counter.
    fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        let seq = self.seq;
        self.seq = seq.checked_add(1).ok_or(Error::SeqExhausted)?;
        let ct = self
            .aead
            .encrypt(&Self::nonce(seq), plain)
            .map_err(|_| Error::Internal("AEAD refused to seal"))?;
        let mut out = Vec::with_capacity(4 + ct.len());
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Remove this layer from `bytes`, using the embedded sequence number.
    fn open(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::from_slice(bytes);
        let seq = r.take_u32().map_err(|_| Error::BadCiphertext)?;
        let ct = r.take_rest();
        self.aead
            .decrypt(&Self::nonce(seq), ct)
            .map_err(|_| Error::BadCiphertext)
    }
}

/// The pair of direction ciphers shared between a circuit owner and one
/// hop.
///
/// Both ends build the same `HopLayer` from their [`HopKeys`]; which
/// operations they call depends on their role.  The owner seals outbound
/// and opens inbound; the relay opens outbound and seals inbound.
pub struct HopLayer {
    /// Cipher for traffic flowing away from the circuit owner.
    fwd: LayerCipher,
    /// Cipher for traffic flowing back toward the circuit owner.
    bwd: LayerCipher,
}

impl std::fmt::Debug for HopLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HopLayer(..)")
    }
}

impl HopLayer {
    /// Build the layer ciphers for one hop from its established keys.
    pub fn new(keys: &HopKeys) -> Self {
        HopLayer {
            fwd: LayerCipher::new(&keys.fwd),
            bwd: LayerCipher::new(&keys.bwd),
        }
    }

    /// Owner role: add this layer to an outbound payload.
    pub fn seal_outbound(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        self.fwd.seal(plain)
    }

    /// Owner role: remove this layer from an inbound payload.
    pub fn open_inbound(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.bwd.open(bytes)
    }

    /// Relay role: remove this layer from a payload heading outward.
    pub fn open_outbound(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.fwd.open(bytes)
    }

    /// Relay role: add this layer to a payload heading back inward.
    pub fn seal_inbound(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        self.bwd.seal(plain)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn keys() -> HopKeys {
        HopKeys {
            fwd: [0x0f; 32],
            bwd: [0xb0; 32],
        }
    }

    #[test]
    fn round_trip_both_directions() {
        let mut owner = HopLayer::new(&keys());
        let mut relay = HopLayer::new(&keys());

        let sealed = owner.seal_outbound(b"out you go").unwrap();
        assert_eq!(sealed.len(), b"out you go".len() + LAYER_OVERHEAD);
        assert_eq!(relay.open_outbound(&sealed).unwrap(), b"out you go");

        let sealed = relay.seal_inbound(b"and back").unwrap();
        assert_eq!(owner.open_inbound(&sealed).unwrap(), b"and back");
    }

    #[test]
    fn sequence_numbers_advance() {
        let mut owner = HopLayer::new(&keys());
        let first = owner.seal_outbound(b"x").unwrap();
        let second = owner.seal_outbound(b"x").unwrap();
        assert_eq!(&first[..4], &[0, 0, 0, 0]);
        assert_eq!(&second[..4], &[0, 0, 0, 1]);
        assert_ne!(&first[4..], &second[4..]);
    }

    #[test]
    fn out_of_order_delivery_tolerated() {
        let mut owner = HopLayer::new(&keys());
        let relay = HopLayer::new(&keys());
        let a = owner.seal_outbound(b"first").unwrap();
        let b = owner.seal_outbound(b"second").unwrap();
        assert_eq!(relay.open_outbound(&b).unwrap(), b"second");
        assert_eq!(relay.open_outbound(&a).unwrap(), b"first");
    }

    #[test]
    fn debug_output_reveals_no_key_material() {
        let layer = HopLayer::new(&keys());
        assert_eq!(format!("{layer:?}"), "HopLayer(..)");
    }

    #[test]
    fn tampering_detected() {
        let mut owner = HopLayer::new(&keys());
        let relay = HopLayer::new(&keys());
        let mut sealed = owner.seal_outbound(b"payload").unwrap();
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0x01;
        assert!(matches!(
            relay.open_outbound(&sealed),
            Err(Error::BadCiphertext)
        ));
    }

    #[test]
    fn truncation_detected() {
        let relay = HopLayer::new(&keys());
        assert!(matches!(
            relay.open_outbound(&[1, 2, 3]),
            Err(Error::BadCiphertext)
        ));
    }

    #[test]
    fn directions_use_distinct_keys() {
        let mut owner = HopLayer::new(&keys());
        let relay = HopLayer::new(&keys());
        let sealed = owner.seal_outbound(b"payload").unwrap();
        // The same bytes must not open as inbound traffic.
        assert!(relay.open_inbound(&sealed).is_err());
    }
}
