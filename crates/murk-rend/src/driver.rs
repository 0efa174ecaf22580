//! The rendezvous driver task and the [`RendClient`] handle in front of
//! it.
//!
//! The community reactor reports rendezvous signals on an event stream,
//! but the code that cares about each signal is some `serve` or `connect`
//! call parked in another task.  The driver owns the stream and routes:
//! acknowledgements wake registered waiters, and incoming introductions
//! fan out to per-introduction answer tasks.  Signals that arrive before
//! their waiter are held briefly rather than dropped, so registration
//! order cannot race the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info};

use murk_cell::msg::{
    AnyMsg, DestroyReason, EstablishIntro, EstablishRendezvous, Introduce1, Rendezvous1,
};
use murk_cell::{CircId, PeerDescriptor, PeerId, RendCookie, ServiceId};
use murk_community::{Community, RendEvent};
use murk_proto::handshake::{self, service_id_for_key};
use murk_proto::{CircKind, CircState, TunnelKeypair};

use crate::intro::IntroPayload;
use crate::{DhtProvider, Error, RendConfig, Result};

/// How often the driver sweeps out stale waiters and unclaimed signals.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long an unclaimed signal is held for a late waiter.
const SIGNAL_EXPIRY: Duration = Duration::from_secs(60);

/// A request from a [`RendClient`] to the driver task.
enum Ctrl {
    /// Resolve when the terminal hop of `circ` acknowledges an
    /// ESTABLISH_INTRO or ESTABLISH_RENDEZVOUS.
    AwaitEstablished {
        /// The circuit whose acknowledgement we want.
        circ: CircId,
        /// Resolved on arrival.
        tx: oneshot::Sender<()>,
    },
    /// Resolve with the seeder's handshake when RENDEZVOUS2 arrives on
    /// `circ`.
    AwaitCompleted {
        /// The parked rendezvous circuit.
        circ: CircId,
        /// Resolved with the handshake bytes.
        tx: oneshot::Sender<Vec<u8>>,
    },
    /// Start answering introductions for a service.
    RegisterService {
        /// The service identity.
        service: ServiceId,
        /// The keypair that can open its introductions.
        keypair: Arc<TunnelKeypair>,
        /// The introduction circuit they arrive on.
        circ: CircId,
    },
    /// Stop the driver task.
    Shutdown,
}

/// A hidden service the driver is answering introductions for.
struct ServiceRecord {
    /// The service keypair.
    keypair: Arc<TunnelKeypair>,
    /// The circuit to its introduction point.
    intro_circ: CircId,
}

/// The driver task's state.
struct Driver {
    /// Handle to the community reactor.
    community: Community,
    /// Tuning knobs, shared with the client handle.
    config: RendConfig,
    /// Requests from client handles.
    ctrl: mpsc::UnboundedReceiver<Ctrl>,
    /// Rendezvous signals from the community reactor.
    events: mpsc::UnboundedReceiver<RendEvent>,
    /// Waiters for ESTABLISH acknowledgements, by circuit.
    established_waiters: HashMap<CircId, oneshot::Sender<()>>,
    /// Waiters for RENDEZVOUS2, by circuit.
    completed_waiters: HashMap<CircId, oneshot::Sender<Vec<u8>>>,
    /// Acknowledgements that arrived before their waiter.
    unclaimed_established: HashMap<CircId, Instant>,
    /// RENDEZVOUS2 handshakes that arrived before their waiter.
    unclaimed_completed: HashMap<CircId, (Vec<u8>, Instant)>,
    /// The services we are currently serving.
    services: HashMap<ServiceId, ServiceRecord>,
}

impl Driver {
    /// Run until shutdown or until the community reactor goes away.
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.ctrl.recv() => match maybe {
                    Some(ctrl) => {
                        if !self.handle_ctrl(ctrl) {
                            break;
                        }
                    }
                    None => break,
                },
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }
        debug!("rendezvous driver exiting");
    }

    /// Handle one client request.  Returns false on shutdown.
    fn handle_ctrl(&mut self, ctrl: Ctrl) -> bool {
        match ctrl {
            Ctrl::AwaitEstablished { circ, tx } => {
                if self.unclaimed_established.remove(&circ).is_some() {
                    let _ = tx.send(());
                } else {
                    self.established_waiters.insert(circ, tx);
                }
            }
            Ctrl::AwaitCompleted { circ, tx } => {
                if let Some((hs, _)) = self.unclaimed_completed.remove(&circ) {
                    let _ = tx.send(hs);
                } else {
                    self.completed_waiters.insert(circ, tx);
                }
            }
            Ctrl::RegisterService {
                service,
                keypair,
                circ,
            } => {
                info!(service = %service, circ = %circ, "answering introductions");
                self.services.insert(
                    service,
                    ServiceRecord {
                        keypair,
                        intro_circ: circ,
                    },
                );
            }
            Ctrl::Shutdown => return false,
        }
        true
    }

    /// Route one rendezvous signal.
    fn handle_event(&mut self, event: RendEvent) {
        match event {
            RendEvent::IntroEstablished { circ } | RendEvent::RendezvousEstablished { circ } => {
                match self.established_waiters.remove(&circ) {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => {
                        self.unclaimed_established.insert(circ, Instant::now());
                    }
                }
            }
            RendEvent::RendezvousCompleted { circ, handshake } => {
                match self.completed_waiters.remove(&circ) {
                    Some(tx) => {
                        let _ = tx.send(handshake);
                    }
                    None => {
                        self.unclaimed_completed
                            .insert(circ, (handshake, Instant::now()));
                    }
                }
            }
            RendEvent::Introduction {
                circ,
                service,
                sealed,
            } => self.handle_introduction(circ, service, sealed),
        }
    }

    /// Answer an incoming introduction in a task of its own.
    ///
    /// Failures are logged and dropped; the downloader gives up on its own
    /// timeout and a broken introduction must not take the driver down.
    fn handle_introduction(&mut self, circ: CircId, service: ServiceId, sealed: Vec<u8>) {
        let Some(record) = self.services.get(&service) else {
            debug!(service = %service, "introduction for a service we do not run");
            return;
        };
        if record.intro_circ != circ {
            debug!(service = %service, circ = %circ, "introduction on an unexpected circuit");
            return;
        }
        let community = self.community.clone();
        let keypair = Arc::clone(&record.keypair);
        let sr_hops = self.config.sr_hops;
        tokio::spawn(async move {
            if let Err(e) = answer_introduction(community, keypair, sr_hops, sealed).await {
                debug!(service = %service, "introduction not answered: {}", e);
            }
        });
    }

    /// Drop expired unclaimed signals and waiters nobody is listening to.
    fn sweep(&mut self) {
        let now = Instant::now();
        self.unclaimed_established
            .retain(|_, t| now.duration_since(*t) < SIGNAL_EXPIRY);
        self.unclaimed_completed
            .retain(|_, (_, t)| now.duration_since(*t) < SIGNAL_EXPIRY);
        self.established_waiters.retain(|_, tx| !tx.is_canceled());
        self.completed_waiters.retain(|_, tx| !tx.is_canceled());
    }
}

/// The seeder's half of one rendezvous.
///
/// Opens the sealed introduction, answers the key exchange, meets the
/// downloader at its rendezvous point, and installs the end-to-end layer.
async fn answer_introduction(
    community: Community,
    keypair: Arc<TunnelKeypair>,
    sr_hops: u8,
    sealed: Vec<u8>,
) -> Result<()> {
    let plain = handshake::open_sealed(&keypair, &sealed)?;
    let intro = IntroPayload::decode(&plain).map_err(|_| Error::Malformed)?;
    let (keys, reply) = {
        let mut rng = rand::thread_rng();
        handshake::server(&mut rng, &keypair, &intro.handshake)?
    };

    let pending = community
        .create_circuit(
            sr_hops.saturating_add(1),
            CircKind::RpSeeder,
            Some(intro.rp),
        )
        .await?;
    let circ = pending.wait_ready().await?;

    // The cookie must reach the rendezvous point before the extra layer
    // goes on: once installed, everything outbound is sealed under it.
    community.send_msg(
        circ,
        Rendezvous1 {
            cookie: intro.cookie,
            handshake: reply,
        }
        .into(),
    );
    community.add_end_to_end_layer(circ, keys.swapped()).await?;
    info!(circ = %circ, "rendezvous answered");
    Ok(())
}

/// Start the rendezvous driver over a running community.
///
/// Takes the rendezvous event stream that [`murk_community::launch`]
/// handed back.  The driver task runs until [`RendClient::shutdown`] is
/// called or the community reactor goes away.
pub fn launch(
    community: Community,
    config: RendConfig,
    dht: Arc<dyn DhtProvider>,
    rend_events: mpsc::UnboundedReceiver<RendEvent>,
) -> RendClient {
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        community: community.clone(),
        config: config.clone(),
        ctrl: ctrl_rx,
        events: rend_events,
        established_waiters: HashMap::new(),
        completed_waiters: HashMap::new(),
        unclaimed_established: HashMap::new(),
        unclaimed_completed: HashMap::new(),
        services: HashMap::new(),
    };
    tokio::spawn(driver.run());
    RendClient {
        community,
        config,
        dht,
        ctrl: ctrl_tx,
    }
}

/// A handle for rendezvous operations.
///
/// Cheap to clone; all clones talk to the same driver.
#[derive(Clone)]
pub struct RendClient {
    /// Handle to the community reactor.
    community: Community,
    /// Tuning knobs.
    config: RendConfig,
    /// Where advertisements go.
    dht: Arc<dyn DhtProvider>,
    /// Requests into the driver task.
    ctrl: mpsc::UnboundedSender<Ctrl>,
}

impl std::fmt::Debug for RendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RendClient {
    /// Start serving a hidden service under `keypair`.
    ///
    /// Builds a circuit to a verified relay, asks it to act as our
    /// introduction point, and advertises the pair in the DHT.
    /// Introductions are then answered in the background for as long as
    /// the introduction circuit lives; when it breaks, call `serve`
    /// again.
    ///
    /// Returns the identity downloaders reach the service under.
    pub async fn serve(&self, keypair: TunnelKeypair) -> Result<ServiceId> {
        let service = service_id_for_key(&keypair.public_bytes());
        let keypair = Arc::new(keypair);

        let intro_peer = self.pick_relay(&[]).await?;
        let pending = self
            .community
            .create_circuit(
                self.config.intro_hops.saturating_add(1),
                CircKind::IpSeeder,
                Some(intro_peer.clone()),
            )
            .await?;
        let circ = pending.wait_ready().await?;

        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(Ctrl::AwaitEstablished { circ, tx })
            .map_err(|_| Error::Shutdown)?;
        self.community.send_msg(
            circ,
            EstablishIntro {
                service,
                auth_key: keypair.public_bytes(),
            }
            .into(),
        );
        self.await_ack(circ, rx).await?;

        // Register before advertising, so nobody can find the service
        // while its introductions would still be dropped on the floor.
        self.ctrl
            .send(Ctrl::RegisterService {
                service,
                keypair,
                circ,
            })
            .map_err(|_| Error::Shutdown)?;
        self.dht.announce(service, intro_peer).await;
        info!(service = %service, circ = %circ, "hidden service up");
        Ok(service)
    }

    /// Connect anonymously to the hidden service whose public key is
    /// `service_key`.
    ///
    /// On success the returned circuit carries traffic end to end: data
    /// sent on it surfaces at the seeder and replies come back the same
    /// way, unreadable to every relay in between.
    pub async fn connect(&self, service_key: [u8; 32]) -> Result<CircId> {
        let service = service_id_for_key(&service_key);

        let intros = self.dht.lookup(service).await;
        let intro = {
            let mut rng = rand::thread_rng();
            intros.choose(&mut rng).cloned()
        }
        .ok_or(Error::NotFound)?;
        let rp = self.pick_relay(&[intro.id]).await?;
        let cookie = {
            let mut rng = rand::thread_rng();
            RendCookie::random(&mut rng)
        };

        // Park a circuit at the rendezvous point under the cookie.
        let pending = self
            .community
            .create_circuit(
                self.config.dl_hops.saturating_add(1),
                CircKind::RpDownloader,
                Some(rp.clone()),
            )
            .await?;
        let circ = pending.wait_ready().await?;
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(Ctrl::AwaitEstablished { circ, tx })
            .map_err(|_| Error::Shutdown)?;
        self.community
            .send_msg(circ, EstablishRendezvous { cookie }.into());
        self.await_ack(circ, rx).await?;

        // Our half of the end-to-end exchange rides inside the sealed
        // introduction; only the service key can open it.
        let (state, hs) = {
            let mut rng = rand::thread_rng();
            handshake::client1(&mut rng, &service_key)
        };
        let payload = IntroPayload {
            rp,
            cookie,
            handshake: hs,
        };
        let plain = payload
            .encode()
            .map_err(|_| Error::Internal("introduction payload failed to encode"))?;
        let sealed = {
            let mut rng = rand::thread_rng();
            handshake::seal_to_key(&mut rng, &service_key, &plain)?
        };

        let (tx, rx) = oneshot::channel();
        self.ctrl
            .send(Ctrl::AwaitCompleted { circ, tx })
            .map_err(|_| Error::Shutdown)?;
        self.send_introduction(&intro, Introduce1 { service, sealed })
            .await?;

        let reply = match timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => {
                self.community.retire_circuit(circ, DestroyReason::TIMEOUT);
                return Err(Error::Timeout);
            }
        };
        let keys = handshake::client2(state, &reply)?;
        self.community.add_end_to_end_layer(circ, keys).await?;
        info!(service = %service, circ = %circ, "rendezvous complete");
        Ok(circ)
    }

    /// Stop the driver task.  Operations in flight fail with
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.ctrl.send(Ctrl::Shutdown);
    }

    /// Wait for an ESTABLISH acknowledgement, tearing the circuit down on
    /// timeout.
    async fn await_ack(&self, circ: CircId, rx: oneshot::Receiver<()>) -> Result<()> {
        match timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                self.community.retire_circuit(circ, DestroyReason::TIMEOUT);
                Err(Error::Timeout)
            }
        }
    }

    /// Choose one verified relay, excluding the given identities.
    async fn pick_relay(&self, exclude: &[PeerId]) -> Result<PeerDescriptor> {
        let candidates = self.community.verified_candidates().await?;
        let eligible: Vec<&PeerDescriptor> = candidates
            .iter()
            .filter(|d| d.is_relay())
            .filter(|d| !exclude.contains(&d.id))
            .collect();
        let mut rng = rand::thread_rng();
        eligible
            .choose(&mut rng)
            .map(|d| (*d).clone())
            .ok_or(Error::NoRelay)
    }

    /// Deliver an INTRODUCE1 to the introduction point, tunneled through
    /// a data circuit so it never sees our address.
    async fn send_introduction(&self, intro: &PeerDescriptor, msg: Introduce1) -> Result<()> {
        let cell = AnyMsg::from(msg)
            .into_cell(None)
            .map_err(|_| Error::Internal("introduction cell failed to encode"))?;
        let circ = self.data_circuit().await?;
        self.community.send_data(circ, intro.addr, cell.encode());
        Ok(())
    }

    /// Find a ready data circuit for one-shot sends, building one if
    /// there is none.
    async fn data_circuit(&self) -> Result<CircId> {
        let circuits = self.community.circuits().await?;
        let ready: Vec<CircId> = circuits
            .iter()
            .filter(|c| c.kind == CircKind::Data && c.state == CircState::Ready)
            .map(|c| c.id)
            .collect();
        let picked = {
            let mut rng = rand::thread_rng();
            ready.choose(&mut rng).copied()
        };
        if let Some(id) = picked {
            return Ok(id);
        }
        let pending = self
            .community
            .create_circuit(self.config.dl_hops.max(1), CircKind::Data, None)
            .await?;
        pending.wait_ready().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    use murk_community::{launch as launch_community, CommunityConfig};

    /// A community on a loopback port with no peers, plus a synthetic
    /// rendezvous event stream we can feed by hand.
    async fn test_client() -> (RendClient, mpsc::UnboundedSender<RendEvent>) {
        let config = CommunityConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            min_circuits: 0,
            ..CommunityConfig::default()
        };
        let keypair = {
            let mut rng = rand::thread_rng();
            TunnelKeypair::generate(&mut rng)
        };
        let handles = launch_community(config, keypair).await.unwrap();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = launch(
            handles.community,
            RendConfig::default(),
            Arc::new(crate::InMemoryDht::new()),
            event_rx,
        );
        (client, event_tx)
    }

    fn circ(n: u32) -> CircId {
        CircId::new(n).unwrap()
    }

    #[tokio::test]
    async fn waiter_sees_a_signal_that_arrives_later() {
        let (client, events) = test_client().await;
        let (tx, rx) = oneshot::channel();
        client
            .ctrl
            .send(Ctrl::AwaitEstablished { circ: circ(7), tx })
            .unwrap();
        events
            .send(RendEvent::IntroEstablished { circ: circ(7) })
            .unwrap();
        client.await_ack(circ(7), rx).await.unwrap();
    }

    #[tokio::test]
    async fn signal_arriving_before_its_waiter_is_held() {
        let (client, events) = test_client().await;
        events
            .send(RendEvent::RendezvousCompleted {
                circ: circ(9),
                handshake: vec![1, 2, 3],
            })
            .unwrap();
        // Give the driver a chance to file it as unclaimed.
        tokio::task::yield_now().await;
        let (tx, rx) = oneshot::channel();
        client
            .ctrl
            .send(Ctrl::AwaitCompleted { circ: circ(9), tx })
            .unwrap();
        let hs = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(hs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn introductions_for_unknown_services_are_dropped() {
        let (client, events) = test_client().await;
        events
            .send(RendEvent::Introduction {
                circ: circ(3),
                service: ServiceId::from_bytes([1; 20]),
                sealed: vec![0; 64],
            })
            .unwrap();
        // The driver must survive it and keep serving requests.
        let (tx, rx) = oneshot::channel();
        client
            .ctrl
            .send(Ctrl::AwaitEstablished { circ: circ(4), tx })
            .unwrap();
        events
            .send(RendEvent::RendezvousEstablished { circ: circ(4) })
            .unwrap();
        client.await_ack(circ(4), rx).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_fails_waiters_cleanly() {
        let (client, _events) = test_client().await;
        client.shutdown();
        let (tx, rx) = oneshot::channel();
        // The send may still succeed while the driver drains its queue;
        // either way the waiter must resolve with Shutdown, not hang.
        let _ = client.ctrl.send(Ctrl::AwaitEstablished { circ: circ(5), tx });
        match client.await_ack(circ(5), rx).await {
            Err(Error::Shutdown) => {}
            other => panic!("expected shutdown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_without_an_advertised_service_is_not_found() {
        let (client, _events) = test_client().await;
        match client.connect([0x42; 32]).await {
            Err(Error::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
