//! Relay reservations and circuit addressing.

use crate::network::OverlayNetwork;
use crate::NetworkError;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lifecycle of the reservation on the static relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservationState {
    /// Never requested.
    #[default]
    Idle,
    /// Listening on the circuit address, waiting for the relay to accept.
    Pending,
    Active,
    /// The relay refused or could not be reached. Connectivity is degraded.
    Failed,
}

impl ReservationState {
    /// The reservation attempt has an outcome.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }

    pub fn needs_refresh(self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

/// The static relay this node reserves a slot on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    address: Multiaddr,
    peer_id: PeerId,
}

impl RelayTarget {
    /// `address` must end in `/p2p/<relay-id>`.
    pub fn new(address: Multiaddr) -> Result<Self, NetworkError> {
        let peer_id =
            extract_peer_id(&address).ok_or_else(|| NetworkError::RelayAddress(address.clone()))?;
        Ok(Self { address, peer_id })
    }

    pub fn address(&self) -> &Multiaddr {
        &self.address
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// `<relay>/p2p-circuit`, listened on to request a reservation.
    pub fn listen_address(&self) -> Multiaddr {
        self.address.clone().with(Protocol::P2pCircuit)
    }

    /// `<relay>/p2p-circuit/p2p/<target>`.
    pub fn circuit_address(&self, target: PeerId) -> Multiaddr {
        self.listen_address().with(Protocol::P2p(target))
    }
}

/// Last `/p2p/<id>` component of `addr`.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|protocol| match protocol {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .last()
}

/// Periodically re-request the relay reservation until `shutdown` fires.
///
/// A tick only re-listens when the reservation is idle or failed. An active
/// reservation is renewed by the relay client itself.
pub fn spawn_reservation_refresh(
    network: Arc<OverlayNetwork>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already reserved.
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let state = network.reservation_state();
                    if !state.needs_refresh() {
                        debug!(?state, "relay reservation still live");
                        continue;
                    }
                    info!(?state, "refreshing relay reservation");
                    if let Err(err) = network.make_reservation() {
                        warn!("relay reservation refresh failed: {err}");
                        if matches!(err, NetworkError::ChannelClosed) {
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("relay refresh loop stopped");
    })
}
