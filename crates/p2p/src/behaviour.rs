//! Combined network behaviour driven by the swarm task.

use crate::config::{DhtMode, NetworkConfig};
use crate::protocols::{
    FileTransferCodec, FileTransferRequest, FileTransferResponse, MetadataQueryCodec,
    MetadataQueryRequest, MetadataQueryResponse, PeerExchangeCodec, PeerExchangeMessage,
    FILE_TRANSFER_PROTOCOL, METADATA_QUERY_PROTOCOL, PEER_EXCHANGE_PROTOCOL,
};
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{dcutr, identify, identity, kad, ping, relay, upnp};
use std::iter;

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "ComposedEvent")]
pub(crate) struct ComposedBehaviour {
    pub(crate) identify: identify::Behaviour,
    pub(crate) ping: ping::Behaviour,
    pub(crate) kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub(crate) relay_client: Toggle<relay::client::Behaviour>,
    pub(crate) relay_server: Toggle<relay::Behaviour>,
    pub(crate) dcutr: Toggle<dcutr::Behaviour>,
    pub(crate) upnp: Toggle<upnp::tokio::Behaviour>,
    pub(crate) peer_exchange: request_response::Behaviour<PeerExchangeCodec>,
    pub(crate) metadata_query: request_response::Behaviour<MetadataQueryCodec>,
    pub(crate) file_transfer: request_response::Behaviour<FileTransferCodec>,
}

impl ComposedBehaviour {
    pub(crate) fn new(
        local_key: &identity::Keypair,
        config: &NetworkConfig,
        relay_client: Option<relay::client::Behaviour>,
    ) -> Self {
        let peer_id = local_key.public().to_peer_id();

        let identify = identify::Behaviour::new(
            identify::Config::new(config.protocol_version.clone(), local_key.public())
                .with_agent_version(config.agent_version.clone()),
        );

        let mut kad_cfg = kad::Config::new(kad::PROTOCOL_NAME);
        kad_cfg.set_query_timeout(config.kad_query_timeout);
        // Inbound writes surface as events and are stored only after validation.
        kad_cfg.set_record_filtering(kad::StoreInserts::FilterBoth);
        let store = kad::store::MemoryStore::new(peer_id);
        let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad_cfg);
        kademlia.set_mode(Some(match config.dht_mode {
            DhtMode::Client => kad::Mode::Client,
            DhtMode::Server => kad::Mode::Server,
        }));

        let relay_server = Toggle::from(
            config
                .enable_relay_server
                .then(|| relay::Behaviour::new(peer_id, relay_server_config(config))),
        );
        let dcutr = Toggle::from(
            config
                .enable_hole_punching
                .then(|| dcutr::Behaviour::new(peer_id)),
        );
        let upnp = Toggle::from(config.enable_upnp.then(upnp::tokio::Behaviour::default));

        let rr_config =
            request_response::Config::default().with_request_timeout(config.request_timeout);

        let peer_exchange = request_response::Behaviour::new(
            iter::once((PEER_EXCHANGE_PROTOCOL, ProtocolSupport::Full)),
            rr_config.clone(),
        );
        let metadata_query = request_response::Behaviour::new(
            iter::once((METADATA_QUERY_PROTOCOL, ProtocolSupport::Full)),
            rr_config,
        );
        let file_transfer = request_response::Behaviour::with_codec(
            FileTransferCodec::new(config.max_transfer_bytes),
            iter::once((FILE_TRANSFER_PROTOCOL, ProtocolSupport::Full)),
            request_response::Config::default().with_request_timeout(config.transfer_timeout),
        );

        Self {
            identify,
            ping: ping::Behaviour::default(),
            kademlia,
            relay_client: Toggle::from(relay_client),
            relay_server,
            dcutr,
            upnp,
            peer_exchange,
            metadata_query,
            file_transfer,
        }
    }
}

/// Relay server limits. The libp2p defaults cap circuits at 128 KiB and two
/// minutes, which cuts off relayed file transfers.
pub(crate) fn relay_server_config(config: &NetworkConfig) -> relay::Config {
    relay::Config {
        max_circuit_bytes: config.relay_circuit_max_bytes,
        max_circuit_duration: config.relay_circuit_max_duration,
        ..relay::Config::default()
    }
}

/// Helper enum produced by the derived [`NetworkBehaviour`].
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum ComposedEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    Kademlia(kad::Event),
    RelayClient(relay::client::Event),
    RelayServer(relay::Event),
    Dcutr(dcutr::Event),
    Upnp(upnp::Event),
    PeerExchange(request_response::Event<PeerExchangeMessage, ()>),
    MetadataQuery(request_response::Event<MetadataQueryRequest, MetadataQueryResponse>),
    FileTransfer(request_response::Event<FileTransferRequest, FileTransferResponse>),
}

impl From<identify::Event> for ComposedEvent {
    fn from(value: identify::Event) -> Self {
        ComposedEvent::Identify(value)
    }
}

impl From<ping::Event> for ComposedEvent {
    fn from(value: ping::Event) -> Self {
        ComposedEvent::Ping(value)
    }
}

impl From<kad::Event> for ComposedEvent {
    fn from(value: kad::Event) -> Self {
        ComposedEvent::Kademlia(value)
    }
}

impl From<relay::client::Event> for ComposedEvent {
    fn from(value: relay::client::Event) -> Self {
        ComposedEvent::RelayClient(value)
    }
}

impl From<relay::Event> for ComposedEvent {
    fn from(value: relay::Event) -> Self {
        ComposedEvent::RelayServer(value)
    }
}

impl From<dcutr::Event> for ComposedEvent {
    fn from(value: dcutr::Event) -> Self {
        ComposedEvent::Dcutr(value)
    }
}

impl From<upnp::Event> for ComposedEvent {
    fn from(value: upnp::Event) -> Self {
        ComposedEvent::Upnp(value)
    }
}

impl From<request_response::Event<PeerExchangeMessage, ()>> for ComposedEvent {
    fn from(value: request_response::Event<PeerExchangeMessage, ()>) -> Self {
        ComposedEvent::PeerExchange(value)
    }
}

impl From<request_response::Event<MetadataQueryRequest, MetadataQueryResponse>> for ComposedEvent {
    fn from(value: request_response::Event<MetadataQueryRequest, MetadataQueryResponse>) -> Self {
        ComposedEvent::MetadataQuery(value)
    }
}

impl From<request_response::Event<FileTransferRequest, FileTransferResponse>> for ComposedEvent {
    fn from(value: request_response::Event<FileTransferRequest, FileTransferResponse>) -> Self {
        ComposedEvent::FileTransfer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn relay_server_limits_follow_the_config() {
        let config = NetworkConfig {
            relay_circuit_max_bytes: 64 * 1024 * 1024,
            relay_circuit_max_duration: Duration::from_secs(900),
            ..NetworkConfig::default()
        };
        let relay = relay_server_config(&config);
        assert_eq!(relay.max_circuit_bytes, 64 * 1024 * 1024);
        assert_eq!(relay.max_circuit_duration, Duration::from_secs(900));
        assert_eq!(relay.max_circuits, relay::Config::default().max_circuits);
    }
}
