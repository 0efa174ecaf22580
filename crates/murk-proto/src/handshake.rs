//! The hop handshake: agreeing on layer keys with one relay.
//!
//! This is an ntor-style one-way-authenticated key exchange over X25519.
//! The initiator sends a single ephemeral public key; the responder answers
//! with its own ephemeral key plus an authentication tag computed under the
//! derived keys.  A valid tag proves the responder holds the private half
//! of the *static* tunnel key the initiator dialed, while the initiator
//! itself stays anonymous.
//!
//! On the wire the client message is 32 bytes (`X`) and the server reply is
//! 64 bytes (`Y || AUTH`).  Both sides end up with a [`HopKeys`]: one
//! ChaCha20-Poly1305 key per direction.
//!
//! The same exchange doubles as the end-to-end rendezvous handshake, with
//! the hidden service's key standing in for a relay's tunnel key, and the
//! [`seal_to_key`] sealed box (a one-shot variant of the same construction)
//! protects introduction payloads on their way to the service.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use murk_bytes::Reader;
use murk_cell::{PeerId, ServiceId};

use crate::{Error, Result};

/// Protocol identifier, mixed into every key derivation.
const PROTO_ID: &[u8] = b"murk-ntor-x25519-sha256-1";
/// HKDF info label for expanding hop keys.
const T_KEY: &[u8] = b"murk-ntor-x25519-sha256-1:key_expand";
/// HMAC label for the responder's authentication tag.
const T_AUTH: &[u8] = b"murk-ntor-x25519-sha256-1:auth";
/// HKDF info label for sealed-box keys.
const T_SEAL: &[u8] = b"murk-ntor-x25519-sha256-1:seal";

/// Length of the client's handshake message.
pub const CLIENT_HANDSHAKE_LEN: usize = 32;
/// Length of the server's handshake reply.
pub const SERVER_HANDSHAKE_LEN: usize = 64;

/// The symmetric keys both ends of a hop handshake arrive at.
///
/// `fwd` protects traffic flowing away from the circuit owner, `bwd`
/// traffic flowing back.  The in-memory copies are wiped on drop.
pub struct HopKeys {
    /// Key for the owner-to-relay direction.
    pub(crate) fwd: [u8; 32],
    /// Key for the relay-to-owner direction.
    pub(crate) bwd: [u8; 32],
}

impl HopKeys {
    /// Assemble hop keys from explicit key material.
    pub fn new(fwd: [u8; 32], bwd: [u8; 32]) -> HopKeys {
        HopKeys { fwd, bwd }
    }

    /// Exchange the two directions.
    ///
    /// A hidden service uses this on the keys from its side of the
    /// end-to-end handshake: what the downloader seals as "forward", the
    /// service must treat as arriving traffic, and vice versa.  With the
    /// keys swapped, the extra layer behaves like any other hop.
    pub fn swapped(mut self) -> HopKeys {
        std::mem::swap(&mut self.fwd, &mut self.bwd);
        self
    }
}

impl Drop for HopKeys {
    fn drop(&mut self) {
        self.fwd.zeroize();
        self.bwd.zeroize();
    }
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HopKeys(..)")
    }
}

/// A peer's long-term tunnel keypair.
///
/// The public half is what other peers dial in CREATE and EXTEND cells,
/// and its hash is the peer's overlay identity.  A hidden service keypair
/// is the same type with a different job.
pub struct TunnelKeypair {
    /// The private key.
    secret: StaticSecret,
    /// The public key, as advertised in peer descriptors.
    public: PublicKey,
}

impl TunnelKeypair {
    /// Generate a fresh keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(&mut *rng);
        let public = PublicKey::from(&secret);
        TunnelKeypair { secret, public }
    }

    /// Reconstruct a keypair from a stored private key.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        TunnelKeypair { secret, public }
    }

    /// Return the private key bytes, for persisting to disk.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Return the public key bytes, as they appear in descriptors.
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Return the overlay identity this keypair implies.
    pub fn peer_id(&self) -> PeerId {
        peer_id_for_key(self.public.as_bytes())
    }
}

impl std::fmt::Debug for TunnelKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelKeypair({:?})", self.peer_id())
    }
}

/// Derive the overlay identity implied by a public tunnel key.
///
/// The identity is the first 20 bytes of the SHA-256 digest of the key, so
/// a peer cannot claim an identity without exhibiting a matching key.
pub fn peer_id_for_key(public: &[u8; 32]) -> PeerId {
    let digest = Sha256::digest(public);
    let mut id = [0_u8; 20];
    id.copy_from_slice(&digest[..20]);
    PeerId::from_bytes(id)
}

/// Derive the service identity implied by a hidden service's public key.
///
/// Same derivation as [`peer_id_for_key`]: anyone who learns a service's
/// public key can compute its identity, and nobody can claim an identity
/// without the key behind it.
pub fn service_id_for_key(public: &[u8; 32]) -> ServiceId {
    let digest = Sha256::digest(public);
    let mut id = [0_u8; 20];
    id.copy_from_slice(&digest[..20]);
    ServiceId::from_bytes(id)
}

/// The initiator's saved state between [`client1`] and [`client2`].
pub struct ClientHandshake {
    /// Our ephemeral private key.
    x: StaticSecret,
    /// Our ephemeral public key, as sent.
    x_pub: PublicKey,
    /// The static key we are dialing.
    b_pub: PublicKey,
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientHandshake(..)")
    }
}

/// Start a handshake with the peer whose public tunnel key is `peer_key`.
///
/// Returns the state to keep and the message to send.
pub fn client1<R: RngCore + CryptoRng>(
    rng: &mut R,
    peer_key: &[u8; 32],
) -> (ClientHandshake, Vec<u8>) {
    let x = StaticSecret::random_from_rng(&mut *rng);
    let x_pub = PublicKey::from(&x);
    let msg = x_pub.as_bytes().to_vec();
    let state = ClientHandshake {
        x,
        x_pub,
        b_pub: PublicKey::from(*peer_key),
    };
    (state, msg)
}

/// Answer a handshake message as the responder owning `keypair`.
///
/// Returns the established keys and the reply to send back.
pub fn server<R: RngCore + CryptoRng>(
    rng: &mut R,
    keypair: &TunnelKeypair,
    msg: &[u8],
) -> Result<(HopKeys, Vec<u8>)> {
    let mut r = Reader::from_slice(msg);
    let x_bytes: [u8; 32] = r
        .extract()
        .map_err(|_| Error::HandshakeProto("client handshake too short"))?;
    r.should_be_exhausted()
        .map_err(|_| Error::HandshakeProto("client handshake too long"))?;
    let x_pub = PublicKey::from(x_bytes);

    let y = StaticSecret::random_from_rng(&mut *rng);
    let y_pub = PublicKey::from(&y);
    let ee = y.diffie_hellman(&x_pub);
    let es = keypair.secret.diffie_hellman(&x_pub);
    let (keys, auth) = derive_keys(&ee, &es, &x_pub, &y_pub, &keypair.public)?;

    let mut reply = Vec::with_capacity(SERVER_HANDSHAKE_LEN);
    reply.extend_from_slice(y_pub.as_bytes());
    reply.extend_from_slice(&auth);
    Ok((keys, reply))
}

/// Complete a handshake from the responder's reply.
///
/// Fails with [`Error::BadHandshakeAuth`] unless the reply proves
/// possession of the key that was dialed in [`client1`].
pub fn client2(state: ClientHandshake, reply: &[u8]) -> Result<HopKeys> {
    let mut r = Reader::from_slice(reply);
    let y_bytes: [u8; 32] = r
        .extract()
        .map_err(|_| Error::HandshakeProto("server handshake too short"))?;
    let auth: [u8; 32] = r
        .extract()
        .map_err(|_| Error::HandshakeProto("server handshake too short"))?;
    r.should_be_exhausted()
        .map_err(|_| Error::HandshakeProto("server handshake too long"))?;
    let y_pub = PublicKey::from(y_bytes);

    let ee = state.x.diffie_hellman(&y_pub);
    let es = state.x.diffie_hellman(&state.b_pub);
    let (keys, expected) = derive_keys(&ee, &es, &state.x_pub, &y_pub, &state.b_pub)?;

    if !bool::from(expected[..].ct_eq(&auth[..])) {
        return Err(Error::BadHandshakeAuth);
    }
    Ok(keys)
}

/// Derive hop keys and the authentication tag from the two shared secrets.
fn derive_keys(
    ee: &SharedSecret,
    es: &SharedSecret,
    x_pub: &PublicKey,
    y_pub: &PublicKey,
    b_pub: &PublicKey,
) -> Result<(HopKeys, [u8; 32])> {
    if !(ee.was_contributory() && es.was_contributory()) {
        return Err(Error::HandshakeProto("degenerate Diffie-Hellman result"));
    }

    let mut ikm = [0_u8; 64];
    ikm[..32].copy_from_slice(ee.as_bytes());
    ikm[32..].copy_from_slice(es.as_bytes());

    let mut salt = Vec::with_capacity(96 + PROTO_ID.len());
    salt.extend_from_slice(x_pub.as_bytes());
    salt.extend_from_slice(y_pub.as_bytes());
    salt.extend_from_slice(b_pub.as_bytes());
    salt.extend_from_slice(PROTO_ID);

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0_u8; 96];
    hk.expand(T_KEY, &mut okm)
        .map_err(|_| Error::Internal("HKDF refused a 96-byte output"))?;
    ikm.zeroize();

    let mut fwd = [0_u8; 32];
    let mut bwd = [0_u8; 32];
    fwd.copy_from_slice(&okm[..32]);
    bwd.copy_from_slice(&okm[32..64]);

    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&okm[64..])
        .map_err(|_| Error::Internal("HMAC refused a 32-byte key"))?;
    mac.update(T_AUTH);
    mac.update(x_pub.as_bytes());
    mac.update(y_pub.as_bytes());
    mac.update(b_pub.as_bytes());
    let tag = mac.finalize().into_bytes();
    let mut auth = [0_u8; 32];
    auth.copy_from_slice(&tag);
    okm.zeroize();

    Ok((HopKeys { fwd, bwd }, auth))
}

/// Seal `plain` so that only the holder of the private half of `key` can
/// read it.  Output is an ephemeral public key followed by the ciphertext.
pub fn seal_to_key<R: RngCore + CryptoRng>(
    rng: &mut R,
    key: &[u8; 32],
    plain: &[u8],
) -> Result<Vec<u8>> {
    let eph = StaticSecret::random_from_rng(&mut *rng);
    let eph_pub = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&PublicKey::from(*key));
    let aead_key = seal_key(&shared, &eph_pub, key)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&aead_key));
    // The key is unique to this message, so a fixed nonce is safe.
    let ct = cipher
        .encrypt(&Nonce::default(), plain)
        .map_err(|_| Error::Internal("AEAD refused to seal"))?;
    let mut out = Vec::with_capacity(32 + ct.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed box addressed to `keypair`.
pub fn open_sealed(keypair: &TunnelKeypair, sealed: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::from_slice(sealed);
    let eph_bytes: [u8; 32] = r
        .extract()
        .map_err(|_| Error::HandshakeProto("sealed box too short"))?;
    let ct = r.take_rest();
    let eph_pub = PublicKey::from(eph_bytes);
    let shared = keypair.secret.diffie_hellman(&eph_pub);
    let aead_key = seal_key(&shared, &eph_pub, &keypair.public_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&aead_key));
    cipher
        .decrypt(&Nonce::default(), ct)
        .map_err(|_| Error::BadCiphertext)
}

/// Derive the symmetric key for a sealed box.
fn seal_key(shared: &SharedSecret, eph_pub: &PublicKey, recipient: &[u8; 32]) -> Result<[u8; 32]> {
    if !shared.was_contributory() {
        return Err(Error::HandshakeProto("degenerate Diffie-Hellman result"));
    }
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(eph_pub.as_bytes());
    salt.extend_from_slice(recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = [0_u8; 32];
    hk.expand(T_SEAL, &mut okm)
        .map_err(|_| Error::Internal("HKDF refused a 32-byte output"))?;
    Ok(okm)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::Error;

    fn rng() -> impl RngCore + CryptoRng {
        rand::thread_rng()
    }

    #[test]
    fn both_sides_agree() {
        let mut rng = rng();
        let relay = TunnelKeypair::generate(&mut rng);
        let (state, msg) = client1(&mut rng, &relay.public_bytes());
        assert_eq!(msg.len(), CLIENT_HANDSHAKE_LEN);

        let (server_keys, reply) = server(&mut rng, &relay, &msg).unwrap();
        assert_eq!(reply.len(), SERVER_HANDSHAKE_LEN);

        let client_keys = client2(state, &reply).unwrap();
        assert_eq!(client_keys.fwd, server_keys.fwd);
        assert_eq!(client_keys.bwd, server_keys.bwd);
        assert_ne!(client_keys.fwd, client_keys.bwd);
    }

    #[test]
    fn saved_state_debug_reveals_no_secrets() {
        let mut rng = rng();
        let (state, _) = client1(&mut rng, &[7_u8; 32]);
        assert_eq!(format!("{state:?}"), "ClientHandshake(..)");
    }

    #[test]
    fn tampered_reply_rejected() {
        let mut rng = rng();
        let relay = TunnelKeypair::generate(&mut rng);
        let (state, msg) = client1(&mut rng, &relay.public_bytes());
        let (_, mut reply) = server(&mut rng, &relay, &msg).unwrap();
        reply[40] ^= 0x01;
        assert!(matches!(client2(state, &reply), Err(Error::BadHandshakeAuth)));
    }

    #[test]
    fn wrong_responder_key_rejected() {
        let mut rng = rng();
        let advertised = TunnelKeypair::generate(&mut rng);
        let imposter = TunnelKeypair::generate(&mut rng);
        let (state, msg) = client1(&mut rng, &advertised.public_bytes());
        let (_, reply) = server(&mut rng, &imposter, &msg).unwrap();
        assert!(matches!(client2(state, &reply), Err(Error::BadHandshakeAuth)));
    }

    #[test]
    fn bad_lengths_rejected() {
        let mut rng = rng();
        let relay = TunnelKeypair::generate(&mut rng);
        assert!(matches!(
            server(&mut rng, &relay, &[0_u8; 31]),
            Err(Error::HandshakeProto(_))
        ));
        assert!(matches!(
            server(&mut rng, &relay, &[0_u8; 33]),
            Err(Error::HandshakeProto(_))
        ));

        let (state, _) = client1(&mut rng, &relay.public_bytes());
        assert!(matches!(
            client2(state, &[0_u8; 63]),
            Err(Error::HandshakeProto(_))
        ));
    }

    #[test]
    fn swapped_exchanges_directions() {
        let keys = HopKeys { fwd: [1; 32], bwd: [2; 32] };
        let swapped = keys.swapped();
        assert_eq!(swapped.fwd, [2; 32]);
        assert_eq!(swapped.bwd, [1; 32]);
    }

    #[test]
    fn identity_follows_key() {
        let mut rng = rng();
        let a = TunnelKeypair::generate(&mut rng);
        let b = TunnelKeypair::generate(&mut rng);
        assert_eq!(a.peer_id(), peer_id_for_key(&a.public_bytes()));
        assert_ne!(a.peer_id(), b.peer_id());

        let restored = TunnelKeypair::from_secret_bytes(a.secret_bytes());
        assert_eq!(restored.peer_id(), a.peer_id());
        assert_eq!(restored.public_bytes(), a.public_bytes());
    }

    #[test]
    fn sealed_box_round_trip() {
        let mut rng = rng();
        let service = TunnelKeypair::generate(&mut rng);
        let sealed = seal_to_key(&mut rng, &service.public_bytes(), b"meet me").unwrap();
        assert_eq!(sealed.len(), 32 + 7 + 16);
        assert_eq!(open_sealed(&service, &sealed).unwrap(), b"meet me");
    }

    #[test]
    fn sealed_box_tamper_rejected() {
        let mut rng = rng();
        let service = TunnelKeypair::generate(&mut rng);
        let mut sealed = seal_to_key(&mut rng, &service.public_bytes(), b"meet me").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert!(matches!(
            open_sealed(&service, &sealed),
            Err(Error::BadCiphertext)
        ));
        assert!(matches!(
            open_sealed(&service, &sealed[..16]),
            Err(Error::HandshakeProto(_))
        ));
    }

    #[test]
    fn sealed_box_wrong_recipient_rejected() {
        let mut rng = rng();
        let service = TunnelKeypair::generate(&mut rng);
        let other = TunnelKeypair::generate(&mut rng);
        let sealed = seal_to_key(&mut rng, &service.public_bytes(), b"meet me").unwrap();
        assert!(open_sealed(&other, &sealed).is_err());
    }
}
