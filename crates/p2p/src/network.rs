//! Handle to the overlay swarm.
//!
//! [`OverlayNetwork::new`] builds the transport and behaviour, then moves
//! the swarm into a background task. Everything else talks to that task
//! through [`Command`]s; replies come back on oneshot channels.

use crate::behaviour::ComposedBehaviour;
use crate::config::NetworkConfig;
use crate::event_loop::EventLoop;
use crate::protocols::{FileTransferResponse, MetadataQueryResponse};
use crate::relay::{extract_peer_id, RelayTarget, ReservationState};
use crate::validator::NamespacedValidator;
use crate::NetworkError;
use anyhow::{Context, Result};
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::{Boxed, OrTransport};
use libp2p::core::upgrade;
use libp2p::{identity, kad, noise, relay, tcp, yamux, Multiaddr, PeerId, Swarm, Transport};
use orcanet_files::{ContentId, MetadataLedger};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, NetworkError>>;

/// Commands used to control the background swarm task.
#[derive(Debug)]
pub(crate) enum Command {
    ConnectViaRelay {
        peer: PeerId,
    },
    MakeReservation,
    StartProviding {
        key: kad::RecordKey,
        reply: Reply<()>,
    },
    /// Batches of providers are streamed to `found` until the query ends.
    FindProviders {
        key: kad::RecordKey,
        found: mpsc::UnboundedSender<HashSet<PeerId>>,
    },
    PutRecord {
        record: kad::Record,
        reply: Reply<()>,
    },
    GetRecord {
        key: kad::RecordKey,
        reply: Reply<Option<Vec<u8>>>,
    },
    QueryMetadata {
        peer: PeerId,
        cid: ContentId,
        reply: Reply<MetadataQueryResponse>,
    },
    RequestFile {
        peer: PeerId,
        cid: ContentId,
        reply: Reply<FileTransferResponse>,
    },
    PushKnownPeers {
        peer: PeerId,
        reply: Reply<usize>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown,
}

/// Events produced by the overlay network.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected { peer: PeerId, address: Multiaddr },
    PeerDisconnected { peer: PeerId },
    NewListenAddr { address: Multiaddr },
    RelayReservationAccepted { relay: PeerId },
    RelayReservationFailed { relay: PeerId, reason: String },
    HolePunchSucceeded { peer: PeerId },
    HolePunchFailed { peer: PeerId, error: String },
    /// A peer pushed its known peers to us.
    KnownPeersReceived { from: PeerId, peers: Vec<PeerId> },
}

pub struct OverlayNetwork {
    peer_id: PeerId,
    relay: Option<RelayTarget>,
    command_tx: mpsc::UnboundedSender<Command>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkEvent>>>,
    listen_addresses: Arc<RwLock<HashSet<Multiaddr>>>,
    reservation: watch::Receiver<ReservationState>,
    _task: JoinHandle<()>,
}

impl OverlayNetwork {
    /// Start the swarm with the default `orcanet` record policy.
    pub fn new(
        config: NetworkConfig,
        keypair: identity::Keypair,
        ledger: MetadataLedger,
    ) -> Result<Self> {
        Self::with_validator(config, keypair, ledger, NamespacedValidator::orcanet())
    }

    /// Start the swarm, validating DHT records with `validator`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_validator(
        config: NetworkConfig,
        keypair: identity::Keypair,
        ledger: MetadataLedger,
        validator: NamespacedValidator,
    ) -> Result<Self> {
        let peer_id = keypair.public().to_peer_id();
        info!("Initialising overlay peer {}", peer_id);

        let relay = config
            .relay_address
            .clone()
            .map(RelayTarget::new)
            .transpose()
            .context("invalid relay address")?;

        let (transport, relay_client) = build_transport(&keypair, relay.is_some())?;
        let behaviour = ComposedBehaviour::new(&keypair, &config, relay_client);
        let swarm_config = libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(config.idle_connection_timeout);
        let mut swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);

        let listen_addrs = if config.listen_addresses.is_empty() {
            vec![crate::config::default_listen_address()]
        } else {
            config.listen_addresses.clone()
        };
        for addr in listen_addrs {
            swarm
                .listen_on(addr.clone())
                .with_context(|| format!("listen on {addr}"))?;
        }

        let mut has_bootstrap = false;
        for address in &config.bootstrap_peers {
            if let Some(peer) = extract_peer_id(address) {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, address.clone());
                has_bootstrap = true;
            }
            if let Err(err) = swarm.dial(address.clone()) {
                warn!("Failed to dial bootstrap {}: {}", address, err);
            }
        }
        if has_bootstrap {
            if let Err(err) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!("DHT bootstrap failed: {err}");
            }
        }

        if let Some(relay) = &relay {
            if let Err(err) = swarm.dial(relay.address().clone()) {
                warn!("Failed to dial relay {}: {}", relay.address(), err);
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events_rx) = mpsc::unbounded_channel();
        let (reservation_tx, reservation) = watch::channel(ReservationState::Idle);
        let listen_addresses = Arc::new(RwLock::new(HashSet::new()));

        let event_loop = EventLoop::new(
            swarm,
            command_rx,
            event_tx,
            listen_addresses.clone(),
            reservation_tx,
            relay.clone(),
            ledger,
            validator,
            &config,
        );
        let task = tokio::spawn(event_loop.run());

        Ok(Self {
            peer_id,
            relay,
            command_tx,
            events_rx: Mutex::new(Some(events_rx)),
            listen_addresses,
            reservation,
            _task: task,
        })
    }

    /// Returns the local peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn relay(&self) -> Option<&RelayTarget> {
        self.relay.as_ref()
    }

    /// Returns a snapshot of the addresses the swarm is listening on.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen_addresses.read().iter().cloned().collect()
    }

    /// Acquire the event receiver stream. Subsequent calls return `None`.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.events_rx.lock().take()
    }

    fn send(&self, command: Command) -> Result<(), NetworkError> {
        self.command_tx
            .send(command)
            .map_err(|_| NetworkError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Dial `peer` through the relay circuit. Failures are logged, not returned.
    pub fn connect_via_relay(&self, peer: PeerId) -> Result<(), NetworkError> {
        if self.relay.is_none() {
            return Err(NetworkError::RelayUnavailable);
        }
        self.send(Command::ConnectViaRelay { peer })
    }

    /// Listen on `<relay>/p2p-circuit`, asking the relay for a reservation.
    pub fn make_reservation(&self) -> Result<(), NetworkError> {
        if self.relay.is_none() {
            return Err(NetworkError::RelayUnavailable);
        }
        self.send(Command::MakeReservation)
    }

    pub fn reservation_state(&self) -> ReservationState {
        *self.reservation.borrow()
    }

    /// Wait until the reservation is accepted or fails, or `timeout` passes.
    pub async fn wait_for_reservation(&self, timeout: Duration) -> ReservationState {
        let mut rx = self.reservation.clone();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_settled())).await;
        let state = match settled {
            Ok(Ok(state)) => *state,
            _ => self.reservation_state(),
        };
        state
    }

    /// Announce this node as a provider of `cid`.
    ///
    /// Resolves once the first publish round finishes.
    pub async fn announce_provider(&self, cid: &ContentId) -> Result<(), NetworkError> {
        let key = kad::RecordKey::new(&cid.dht_key());
        self.request(|reply| Command::StartProviding { key, reply })
            .await
    }

    /// Providers of `cid` seen before the query ends or `timeout` passes.
    ///
    /// Expiry is not an error: whatever was found so far is returned.
    pub async fn find_providers(
        &self,
        cid: &ContentId,
        timeout: Duration,
    ) -> Result<HashSet<PeerId>, NetworkError> {
        let (found, mut batches) = mpsc::unbounded_channel();
        self.send(Command::FindProviders {
            key: kad::RecordKey::new(&cid.dht_key()),
            found,
        })?;

        let mut providers = HashSet::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    debug!(%cid, found = providers.len(), "provider lookup timed out");
                    break;
                }
                batch = batches.recv() => match batch {
                    Some(batch) => providers.extend(batch),
                    None => break,
                },
            }
        }
        Ok(providers)
    }

    /// Store `value` under the namespaced `key` (`/<namespace>/<rest>`).
    pub async fn put_record(&self, key: &str, value: Vec<u8>) -> Result<(), NetworkError> {
        let record = kad::Record::new(kad::RecordKey::new(&key), value);
        self.request(|reply| Command::PutRecord { record, reply })
            .await
    }

    /// Fetch the first valid value stored under `key`.
    pub async fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>, NetworkError> {
        let key = kad::RecordKey::new(&key);
        self.request(|reply| Command::GetRecord { key, reply }).await
    }

    /// Ask `peer` for its metadata records about `cid`.
    pub async fn query_metadata(
        &self,
        peer: PeerId,
        cid: &ContentId,
    ) -> Result<MetadataQueryResponse, NetworkError> {
        let cid = *cid;
        self.request(|reply| Command::QueryMetadata { peer, cid, reply })
            .await
    }

    /// Ask `peer` to send the bytes of `cid`.
    pub async fn request_file(
        &self,
        peer: PeerId,
        cid: &ContentId,
    ) -> Result<FileTransferResponse, NetworkError> {
        let cid = *cid;
        self.request(|reply| Command::RequestFile { peer, cid, reply })
            .await
    }

    /// Send our connected peers to `peer`. Returns how many were listed.
    pub async fn push_known_peers(&self, peer: PeerId) -> Result<usize, NetworkError> {
        self.request(|reply| Command::PushKnownPeers { peer, reply })
            .await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectedPeers { reply })?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    /// Request swarm shutdown.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

impl Drop for OverlayNetwork {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

fn build_transport(
    keypair: &identity::Keypair,
    with_relay: bool,
) -> Result<(Boxed<(PeerId, StreamMuxerBox)>, Option<relay::client::Behaviour>)> {
    let peer_id = keypair.public().to_peer_id();
    let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));

    if with_relay {
        let (relay_transport, relay_behaviour) = relay::client::new(peer_id);
        let transport = OrTransport::new(relay_transport, tcp_transport)
            .upgrade(upgrade::Version::V1)
            .authenticate(noise::Config::new(keypair)?)
            .multiplex(yamux::Config::default())
            .boxed();
        Ok((transport, Some(relay_behaviour)))
    } else {
        let transport = tcp_transport
            .upgrade(upgrade::Version::V1)
            .authenticate(noise::Config::new(keypair)?)
            .multiplex(yamux::Config::default())
            .boxed();
        Ok((transport, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::keypair_from_seed;

    fn ledger() -> (tempfile::TempDir, MetadataLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::open(dir.path(), "test-node").unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn network_initialises() {
        let (_dir, ledger) = ledger();
        let keypair = keypair_from_seed("network-initialises").unwrap();
        let expected = keypair.public().to_peer_id();

        let network = OverlayNetwork::new(NetworkConfig::local(), keypair, ledger)
            .expect("expected network to initialise");
        assert_eq!(network.peer_id(), expected);
        assert_eq!(network.reservation_state(), ReservationState::Idle);
        assert!(network.take_event_receiver().is_some());
        assert!(network.take_event_receiver().is_none());
        network.shutdown();
    }

    #[tokio::test]
    async fn find_providers_with_zero_timeout_returns_promptly() {
        let (_dir, ledger) = ledger();
        let keypair = keypair_from_seed("zero-timeout").unwrap();
        let network = OverlayNetwork::new(NetworkConfig::local(), keypair, ledger).unwrap();
        let cid = ContentId::from_data(b"nobody has this").unwrap();

        let started = std::time::Instant::now();
        let providers = network.find_providers(&cid, Duration::ZERO).await.unwrap();
        assert!(providers.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn relay_operations_need_a_relay() {
        let (_dir, ledger) = ledger();
        let keypair = keypair_from_seed("no-relay").unwrap();
        let network = OverlayNetwork::new(NetworkConfig::local(), keypair, ledger).unwrap();

        assert!(matches!(
            network.make_reservation(),
            Err(NetworkError::RelayUnavailable)
        ));
        assert!(matches!(
            network.connect_via_relay(PeerId::random()),
            Err(NetworkError::RelayUnavailable)
        ));
    }

    #[tokio::test]
    async fn invalid_relay_address_is_fatal() {
        let (_dir, ledger) = ledger();
        let keypair = keypair_from_seed("bad-relay").unwrap();
        let config = NetworkConfig {
            relay_address: Some("/ip4/127.0.0.1/tcp/4001".parse().unwrap()),
            ..NetworkConfig::local()
        };
        assert!(OverlayNetwork::new(config, keypair, ledger).is_err());
    }

    #[tokio::test]
    async fn records_outside_the_namespace_are_rejected_locally() {
        let (_dir, ledger) = ledger();
        let keypair = keypair_from_seed("put-record").unwrap();
        let network = OverlayNetwork::new(NetworkConfig::local(), keypair, ledger).unwrap();

        let err = network
            .put_record("/other/key", b"value".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Validation(_)));
    }

    #[tokio::test]
    async fn waiting_for_a_reservation_returns_the_current_state() {
        let (_dir, first) = ledger();
        let (_relay_dir, second) = ledger();
        let keypair = keypair_from_seed("wait-reservation").unwrap();
        let network = OverlayNetwork::new(NetworkConfig::local(), keypair, first).unwrap();

        let state = network
            .wait_for_reservation(Duration::from_millis(50))
            .await;
        assert_eq!(state, ReservationState::Idle);

        let relay_id = PeerId::random();
        let config = NetworkConfig {
            relay_address: Some(format!("/ip4/127.0.0.1/tcp/9/p2p/{relay_id}").parse().unwrap()),
            ..NetworkConfig::local()
        };
        let keypair = keypair_from_seed("wait-unreachable-relay").unwrap();
        let network = OverlayNetwork::new(config, keypair, second).unwrap();
        network.make_reservation().unwrap();
        let state = network.wait_for_reservation(Duration::from_secs(5)).await;
        assert_ne!(state, ReservationState::Active);
    }

    #[tokio::test]
    async fn reservation_goes_pending_when_requested() {
        let (_dir, ledger) = ledger();
        let keypair = keypair_from_seed("pending").unwrap();
        let relay_id = PeerId::random();
        let config = NetworkConfig {
            relay_address: Some(format!("/ip4/127.0.0.1/tcp/9/p2p/{relay_id}").parse().unwrap()),
            ..NetworkConfig::local()
        };
        let network = OverlayNetwork::new(config, keypair, ledger).unwrap();
        assert_eq!(network.relay().map(|r| r.peer_id()), Some(relay_id));

        network.make_reservation().unwrap();
        let mut rx = network.reservation.clone();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|state| *state != ReservationState::Idle),
        )
        .await
        .expect("reservation state change")
        .map(|state| *state)
        .unwrap();
        assert_ne!(state, ReservationState::Active);
    }
}
