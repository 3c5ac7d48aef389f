//! OrcaNet overlay networking.
//!
//! A libp2p swarm that combines:
//! - **content routing**: Kademlia provider records keyed by content id,
//!   with namespaced record validation;
//! - **relay connectivity**: circuit-relay v2 reservations, circuit dialing
//!   and DCUtR hole punching;
//! - **application protocols**: peer exchange (`/orcanet/p2p`), metadata
//!   query (`/cid-get/1.0.0`) and file transfer (`/senddata/p2p`).
//!
//! The swarm runs on its own task and is driven through [`OverlayNetwork`].

mod behaviour;
pub mod config;
mod event_loop;
pub mod identity;
pub mod network;
pub mod protocols;
pub mod relay;
pub mod service;
pub mod validator;

pub use config::{DhtMode, NetworkConfig};
pub use identity::{keypair_from_seed, peer_id_from_seed};
pub use libp2p::{Multiaddr, PeerId};
pub use network::{NetworkEvent, OverlayNetwork};
pub use protocols::{FileTransferResponse, MetadataQueryResponse};
pub use relay::{spawn_reservation_refresh, RelayTarget, ReservationState};
pub use service::{download_file, query_providers, DownloadedFile, OverlayService};
pub use validator::{
    namespaced_key, AcceptWellFormed, NamespacedValidator, RecordValidator,
    SignedRecordValidator, ValidationError, ORCANET_NAMESPACE,
};

use orcanet_files::ContentId;

/// Overlay network errors
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("overlay swarm command channel closed")]
    ChannelClosed,
    #[error("relay address {0} does not end in /p2p/<peer-id>")]
    RelayAddress(Multiaddr),
    #[error("no relay configured")]
    RelayUnavailable,
    #[error("routing query failed: {0}")]
    Routing(String),
    #[error("record rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("request to {peer} failed: {reason}")]
    Request { peer: PeerId, reason: String },
    #[error("{peer} does not have {cid}")]
    NotFound { peer: PeerId, cid: ContentId },
    #[error("{peer} could not serve {cid}")]
    RemoteFailure { peer: PeerId, cid: ContentId },
    #[error("{peer} sent content hashing to {received}, expected {expected}")]
    ContentMismatch {
        peer: PeerId,
        expected: ContentId,
        received: ContentId,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
