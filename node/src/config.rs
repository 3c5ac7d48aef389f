use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, File as ConfigFile};
use orcanet_p2p::config::default_listen_address;
use orcanet_p2p::{DhtMode, Multiaddr, NetworkConfig, RelayTarget};
use tracing::warn;

use crate::version;

pub const DEFAULT_NODE_ID: &str = "114573476";
pub const DEFAULT_RELAY_ADDRESS: &str =
    "/ip4/130.245.173.221/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN";
pub const DEFAULT_BOOTSTRAP_ADDRESS: &str =
    "/ip4/130.245.173.222/tcp/61020/p2p/12D3KooWM8uovScE5NPihSCKhXe8sbgdJAi88i2aXT2MmwjGWoSX";
const ENV_PREFIX: &str = "ORCANET";

/// Node configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Identity
    /// Seed for the node key and name of the metadata ledger.
    pub node_id: String,
    pub node_info: String,

    // P2P
    pub listen_addresses: Vec<Multiaddr>,
    pub relay_address: Option<Multiaddr>,
    pub bootstrap_addresses: Vec<Multiaddr>,
    pub enable_relay_server: bool,
    pub enable_hole_punching: bool,
    pub enable_upnp: bool,
    pub dht_mode: DhtMode,
    pub max_transfer_bytes: u64,
    pub transfer_timeout_secs: u64,
    pub relay_circuit_max_bytes: u64,
    pub relay_circuit_max_secs: u64,

    // Relay reservation
    pub require_reservation: bool,
    pub reservation_timeout_secs: u64,
    pub reservation_refresh_secs: u64,

    // Lookups
    pub provider_timeout_secs: u64,
    pub peer_query_timeout_secs: u64,

    // Storage
    pub download_dir: PathBuf,

    // Admin API
    pub rpc_host: String,
    pub rpc_port: u16,
    pub shutdown_grace_secs: u64,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let network = NetworkConfig::default();
        Self {
            node_id: DEFAULT_NODE_ID.to_string(),
            node_info: "OrcaNet node".to_string(),
            listen_addresses: vec![default_listen_address()],
            relay_address: DEFAULT_RELAY_ADDRESS.parse().ok(),
            bootstrap_addresses: DEFAULT_BOOTSTRAP_ADDRESS.parse::<Multiaddr>().into_iter().collect(),
            enable_relay_server: true,
            enable_hole_punching: true,
            enable_upnp: true,
            dht_mode: DhtMode::Client,
            max_transfer_bytes: network.max_transfer_bytes,
            transfer_timeout_secs: network.transfer_timeout.as_secs(),
            relay_circuit_max_bytes: network.relay_circuit_max_bytes,
            relay_circuit_max_secs: network.relay_circuit_max_duration.as_secs(),
            require_reservation: false,
            reservation_timeout_secs: 30,
            reservation_refresh_secs: 600,
            provider_timeout_secs: 100,
            peer_query_timeout_secs: 30,
            download_dir: default_download_dir(),
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 6100,
            shutdown_grace_secs: 10,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl NodeConfig {
    /// Layer the optional config file and `ORCANET_*` variables over the
    /// defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));
        let config = builder.build().context("failed to read configuration")?;

        Self::from_config(&config)
    }

    fn from_config(config: &Config) -> Result<Self> {
        let defaults = Self::default();

        let listen_addresses = match get_list_value(config, &["listen_addresses"]) {
            Some(values) => values
                .iter()
                .map(|value| {
                    Multiaddr::from_str(value)
                        .with_context(|| format!("invalid listen address {value}"))
                })
                .collect::<Result<Vec<_>>>()?,
            None => defaults.listen_addresses,
        };

        // An explicitly empty relay address turns the relay off.
        let relay_address = match config.get_string("relay_address") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(
                Multiaddr::from_str(value.trim())
                    .with_context(|| format!("invalid relay address {value}"))?,
            ),
            Err(_) => defaults.relay_address,
        };

        let bootstrap_addresses =
            match get_list_value(config, &["bootstrap_addresses", "bootstrap_address"]) {
                Some(values) => parse_multiaddrs(&values, "bootstrap"),
                None => defaults.bootstrap_addresses,
            };

        let dht_mode = match get_string_value(config, &["dht_mode"]) {
            Some(value) => parse_dht_mode(&value)?,
            None => defaults.dht_mode,
        };

        let rpc_port = get_u64_value(config, &["rpc_port"], u64::from(defaults.rpc_port))?;
        let rpc_port = u16::try_from(rpc_port)
            .map_err(|_| anyhow::anyhow!("rpc_port {rpc_port} is out of range"))?;

        Ok(Self {
            node_id: get_string_value(config, &["node_id"]).unwrap_or(defaults.node_id),
            node_info: get_string_value(config, &["node_info"]).unwrap_or(defaults.node_info),
            listen_addresses,
            relay_address,
            bootstrap_addresses,
            enable_relay_server: get_bool_value(
                config,
                &["enable_relay_server"],
                defaults.enable_relay_server,
            ),
            enable_hole_punching: get_bool_value(
                config,
                &["enable_hole_punching"],
                defaults.enable_hole_punching,
            ),
            enable_upnp: get_bool_value(config, &["enable_upnp"], defaults.enable_upnp),
            dht_mode,
            max_transfer_bytes: get_u64_value(
                config,
                &["max_transfer_bytes"],
                defaults.max_transfer_bytes,
            )?,
            transfer_timeout_secs: get_u64_value(
                config,
                &["transfer_timeout_secs"],
                defaults.transfer_timeout_secs,
            )?,
            relay_circuit_max_bytes: get_u64_value(
                config,
                &["relay_circuit_max_bytes"],
                defaults.relay_circuit_max_bytes,
            )?,
            relay_circuit_max_secs: get_u64_value(
                config,
                &["relay_circuit_max_secs"],
                defaults.relay_circuit_max_secs,
            )?,
            require_reservation: get_bool_value(
                config,
                &["require_reservation"],
                defaults.require_reservation,
            ),
            reservation_timeout_secs: get_u64_value(
                config,
                &["reservation_timeout_secs"],
                defaults.reservation_timeout_secs,
            )?,
            reservation_refresh_secs: get_u64_value(
                config,
                &["reservation_refresh_secs"],
                defaults.reservation_refresh_secs,
            )?,
            provider_timeout_secs: get_u64_value(
                config,
                &["provider_timeout_secs"],
                defaults.provider_timeout_secs,
            )?,
            peer_query_timeout_secs: get_u64_value(
                config,
                &["peer_query_timeout_secs"],
                defaults.peer_query_timeout_secs,
            )?,
            download_dir: get_string_value(config, &["download_dir"])
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            rpc_host: get_string_value(config, &["rpc_host"]).unwrap_or(defaults.rpc_host),
            rpc_port,
            shutdown_grace_secs: get_u64_value(
                config,
                &["shutdown_grace_secs"],
                defaults.shutdown_grace_secs,
            )?,
            log_level: get_string_value(config, &["log_level"]).unwrap_or(defaults.log_level),
            log_format: get_string_value(config, &["log_format"]).unwrap_or(defaults.log_format),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("NODE_ID must not be empty");
        }
        if let Some(relay) = &self.relay_address {
            RelayTarget::new(relay.clone())
                .with_context(|| format!("RELAY_ADDRESS {relay} must end in /p2p/<peer-id>"))?;
        }
        if self.rpc_port == 0 {
            anyhow::bail!("RPC_PORT must be greater than zero");
        }
        for (name, value) in [
            ("PROVIDER_TIMEOUT_SECS", self.provider_timeout_secs),
            ("PEER_QUERY_TIMEOUT_SECS", self.peer_query_timeout_secs),
            ("RESERVATION_TIMEOUT_SECS", self.reservation_timeout_secs),
            ("RESERVATION_REFRESH_SECS", self.reservation_refresh_secs),
            ("SHUTDOWN_GRACE_SECS", self.shutdown_grace_secs),
            ("TRANSFER_TIMEOUT_SECS", self.transfer_timeout_secs),
            ("MAX_TRANSFER_BYTES", self.max_transfer_bytes),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "LOG_FORMAT must be `pretty` or `json`, got `{}`",
                self.log_format
            );
        }
        Ok(())
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            listen_addresses: self.listen_addresses.clone(),
            bootstrap_peers: self.bootstrap_addresses.clone(),
            relay_address: self.relay_address.clone(),
            enable_relay_server: self.enable_relay_server,
            enable_hole_punching: self.enable_hole_punching,
            enable_upnp: self.enable_upnp,
            dht_mode: self.dht_mode,
            node_info: self.node_info.clone(),
            kad_query_timeout: self.provider_timeout(),
            max_transfer_bytes: self.max_transfer_bytes,
            transfer_timeout: self.transfer_timeout(),
            relay_circuit_max_bytes: self.relay_circuit_max_bytes,
            relay_circuit_max_duration: Duration::from_secs(self.relay_circuit_max_secs),
            agent_version: version::agent_version(),
            ..NetworkConfig::default()
        }
    }

    pub fn rpc_address(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn peer_query_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_query_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    pub fn reservation_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.reservation_refresh_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Apply command-line flags on top of the loaded configuration.
pub fn apply_overrides(matches: &clap::ArgMatches, config: &mut NodeConfig) {
    if let Some(node_id) = matches.get_one::<String>("node-id") {
        config.node_id = node_id.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if let Some(download_dir) = matches.get_one::<String>("download-dir") {
        config.download_dir = PathBuf::from(download_dir);
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if matches.get_flag("no-relay") {
        config.relay_address = None;
        config.require_reservation = false;
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads"))
}

fn parse_dht_mode(value: &str) -> Result<DhtMode> {
    match value.to_ascii_lowercase().as_str() {
        "client" => Ok(DhtMode::Client),
        "server" => Ok(DhtMode::Server),
        other => anyhow::bail!("DHT_MODE must be `client` or `server`, got `{other}`"),
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_u64_value(config: &Config, keys: &[&str], default: u64) -> Result<u64> {
    for key in keys {
        if let Ok(raw) = config.get_string(key) {
            let raw = raw.trim();
            return raw
                .parse::<u64>()
                .with_context(|| format!("{key} must be a non-negative integer, got `{raw}`"));
        }
    }
    Ok(default)
}

/// A TOML array, or a comma-separated string from the environment.
fn get_list_value(config: &Config, keys: &[&str]) -> Option<Vec<String>> {
    keys.iter().find_map(|key| {
        if let Ok(values) = config.get_array(key) {
            return Some(
                values
                    .into_iter()
                    .filter_map(|value| value.into_string().ok())
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .collect(),
            );
        }
        config.get_string(key).ok().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .collect()
        })
    })
}

fn parse_multiaddrs(values: &[String], label: &str) -> Vec<Multiaddr> {
    values
        .iter()
        .filter_map(|value| match Multiaddr::from_str(value) {
            Ok(addr) => Some(addr),
            Err(err) => {
                warn!("Invalid {} multiaddr {}: {}", label, value, err);
                None
            }
        })
        .collect()
}
