//! The DHT as the rendezvous layer sees it: two calls.
//!
//! Seeders publish which relay introduces them; downloaders look that up
//! by service identity.  Everything else about the DHT, replication,
//! expiry, transport, belongs to whoever implements the trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use murk_cell::{PeerDescriptor, ServiceId};

/// Where (service, introduction point) advertisements live.
#[async_trait]
pub trait DhtProvider: Send + Sync + 'static {
    /// Find the introduction points advertised for `service`.
    ///
    /// An empty list means the service is unknown.
    async fn lookup(&self, service: ServiceId) -> Vec<PeerDescriptor>;

    /// Advertise that `peer` introduces `service`.
    async fn announce(&self, service: ServiceId, peer: PeerDescriptor);
}

/// A process-local [`DhtProvider`].
///
/// Shares one table among its clones.  Entries never expire; suitable for
/// tests and for single-process setups where every role runs in the same
/// binary.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDht {
    /// The advertisement table.
    table: Arc<Mutex<HashMap<ServiceId, Vec<PeerDescriptor>>>>,
}

impl InMemoryDht {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DhtProvider for InMemoryDht {
    async fn lookup(&self, service: ServiceId) -> Vec<PeerDescriptor> {
        match self.table.lock() {
            Ok(t) => t.get(&service).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn announce(&self, service: ServiceId, peer: PeerDescriptor) {
        if let Ok(mut t) = self.table.lock() {
            let entries = t.entry(service).or_default();
            entries.retain(|p| p.id != peer.id);
            entries.push(peer);
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    use std::net::SocketAddr;

    fn descriptor(port: u16) -> PeerDescriptor {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let mut key = [0_u8; 32];
        key[0] = port as u8;
        PeerDescriptor {
            id: murk_proto::handshake::peer_id_for_key(&key),
            addr,
            tunnel_key: key,
            flags: murk_cell::PeerFlags::RELAY,
        }
    }

    #[tokio::test]
    async fn lookup_returns_what_was_announced() {
        let dht = InMemoryDht::new();
        let service = ServiceId::from_bytes([7_u8; 20]);
        assert!(dht.lookup(service).await.is_empty());

        dht.announce(service, descriptor(2001)).await;
        dht.announce(service, descriptor(2002)).await;
        let found = dht.lookup(service).await;
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.addr.port() == 2001));
    }

    #[tokio::test]
    async fn reannouncing_a_peer_replaces_its_entry() {
        let dht = InMemoryDht::new();
        let service = ServiceId::from_bytes([7_u8; 20]);

        let mut peer = descriptor(2001);
        dht.announce(service, peer.clone()).await;
        peer.addr = "127.0.0.1:2009".parse().unwrap();
        dht.announce(service, peer).await;

        let found = dht.lookup(service).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].addr.port(), 2009);
    }

    #[tokio::test]
    async fn clones_share_one_table() {
        let dht = InMemoryDht::new();
        let service = ServiceId::from_bytes([9_u8; 20]);
        let clone = dht.clone();
        clone.announce(service, descriptor(2003)).await;
        assert_eq!(dht.lookup(service).await.len(), 1);
    }
}
