//! Configuration for the overlay swarm.

use crate::protocols::file_transfer::DEFAULT_MAX_TRANSFER_BYTES;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Kademlia operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DhtMode {
    /// Issue queries but do not answer them.
    #[default]
    Client,
    /// Answer queries and store records for others.
    Server,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Addresses to listen on. Empty means `/ip4/0.0.0.0/tcp/0`.
    pub listen_addresses: Vec<Multiaddr>,
    /// Peers dialed and added to the routing table on startup.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Static relay, including its `/p2p/<id>` suffix.
    pub relay_address: Option<Multiaddr>,
    /// Whether this node relays circuits for others.
    pub enable_relay_server: bool,
    pub enable_hole_punching: bool,
    pub enable_upnp: bool,
    pub dht_mode: DhtMode,
    /// Free-form description returned in metadata query responses.
    pub node_info: String,
    /// Deadline for a peer exchange or metadata query exchange.
    pub request_timeout: Duration,
    /// Deadline for a whole file transfer, payload included.
    pub transfer_timeout: Duration,
    pub kad_query_timeout: Duration,
    pub idle_connection_timeout: Duration,
    /// Largest payload served or accepted. Payloads are held in memory.
    pub max_transfer_bytes: u64,
    /// Byte limit of each circuit relayed for other peers.
    pub relay_circuit_max_bytes: u64,
    /// Lifetime limit of each circuit relayed for other peers.
    pub relay_circuit_max_duration: Duration,
    /// Identify protocol version.
    pub protocol_version: String,
    /// Identify agent version string.
    pub agent_version: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![default_listen_address()],
            bootstrap_peers: Vec::new(),
            relay_address: None,
            enable_relay_server: true,
            enable_hole_punching: true,
            enable_upnp: true,
            dht_mode: DhtMode::Client,
            node_info: "OrcaNet node".to_string(),
            request_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(30 * 60),
            kad_query_timeout: Duration::from_secs(100),
            idle_connection_timeout: Duration::from_secs(60),
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            relay_circuit_max_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            relay_circuit_max_duration: Duration::from_secs(30 * 60),
            protocol_version: "/orcanet/1.0.0".to_string(),
            agent_version: format!("orcanet-p2p/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl NetworkConfig {
    /// Loopback-only configuration without relay or NAT helpers.
    pub fn local() -> Self {
        Self {
            listen_addresses: vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::LOCALHOST))
                .with(Protocol::Tcp(0))],
            enable_relay_server: false,
            enable_hole_punching: false,
            enable_upnp: false,
            ..Self::default()
        }
    }
}

pub fn default_listen_address() -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
        .with(Protocol::Tcp(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_has_listen_address() {
        let config = NetworkConfig::default();
        assert_eq!(
            config.listen_addresses,
            vec!["/ip4/0.0.0.0/tcp/0".parse::<Multiaddr>().unwrap()]
        );
        assert_eq!(config.dht_mode, DhtMode::Client);
        assert!(config.relay_address.is_none());
    }

    #[test]
    fn default_limits_leave_room_for_a_full_transfer() {
        let config = NetworkConfig::default();
        assert!(config.transfer_timeout > config.request_timeout);
        assert!(config.relay_circuit_max_bytes >= config.max_transfer_bytes);
        assert!(config.relay_circuit_max_duration >= config.transfer_timeout);
    }

    #[test]
    fn local_config_disables_nat_helpers() {
        let config = NetworkConfig::local();
        assert!(!config.enable_upnp && !config.enable_relay_server && !config.enable_hole_punching);
        assert_eq!(
            config.listen_addresses[0].to_string(),
            "/ip4/127.0.0.1/tcp/0"
        );
    }
}
