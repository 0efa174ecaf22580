//! The sealed payload carried inside INTRODUCE1 and INTRODUCE2.
//!
//! Only the seeder can open it; the introduction point forwards it blind.
//! It tells the seeder everything needed to meet the downloader: which
//! relay to meet at, the cookie that claims the parked circuit there, and
//! the downloader's half of the end-to-end key exchange.

use murk_bytes::{EncodeResult, Reader, Result, Writer};
use murk_cell::{PeerDescriptor, RendCookie};

/// The plaintext of a sealed introduction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IntroPayload {
    /// The rendezvous point the downloader chose.
    pub(crate) rp: PeerDescriptor,
    /// The cookie its parked circuit is registered under.
    pub(crate) cookie: RendCookie,
    /// The downloader's handshake message for the end-to-end layer.
    pub(crate) handshake: Vec<u8>,
}

impl IntroPayload {
    /// Encode to bytes, ready for sealing.
    pub(crate) fn encode(&self) -> EncodeResult<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        out.write(&self.rp)?;
        out.write(&self.cookie)?;
        out.write_all(&self.handshake);
        Ok(out)
    }

    /// Decode an unsealed payload.
    pub(crate) fn decode(bytes: &[u8]) -> Result<IntroPayload> {
        let mut r = Reader::from_slice(bytes);
        let rp = r.extract()?;
        let cookie = r.extract()?;
        let handshake = r.take_rest().to_vec();
        Ok(IntroPayload {
            rp,
            cookie,
            handshake,
        })
    }
}
