use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use orcanet_files::MetadataLedger;
use orcanet_p2p::{
    keypair_from_seed, spawn_reservation_refresh, NetworkEvent, OverlayNetwork, ReservationState,
};
use orcanet_rpc::{bind_listener, serve, AppState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod version;

use crate::config::{apply_overrides, NodeConfig};
use crate::version::{git_commit_hash, ORCANET_VERSION};

fn build_cli() -> Command {
    Command::new("orcanet-node")
        .version(ORCANET_VERSION)
        .about("OrcaNet peer-to-peer file sharing node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("SEED")
                .help("Seed for the node identity and name of its metadata ledger"),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override the admin API port"),
        )
        .arg(
            Arg::new("download-dir")
                .short('d')
                .long("download-dir")
                .value_name("DIR")
                .help("Directory for downloads and the metadata ledger"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("no-relay")
                .long("no-relay")
                .action(ArgAction::SetTrue)
                .help("Run without the static relay"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<NodeConfig> {
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = NodeConfig::load(config_path.as_deref())?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!(
        "Starting OrcaNet node {} (commit {})",
        ORCANET_VERSION,
        git_commit_hash()
    );
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let keypair = keypair_from_seed(&config.node_id).context("failed to derive node identity")?;

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "failed to create download directory {}",
            config.download_dir.display()
        )
    })?;
    let ledger = MetadataLedger::open(&config.download_dir, &config.node_id)
        .context("failed to load metadata ledger")?;
    info!(
        records = ledger.len(),
        path = %ledger.path().display(),
        "Metadata ledger loaded"
    );

    let network = Arc::new(
        OverlayNetwork::new(config.network_config(), keypair, ledger.clone())
            .context("failed to start the overlay network")?,
    );
    let peer_id = network.peer_id();
    info!("Node ID: {}", peer_id);

    let event_logger = network
        .take_event_receiver()
        .map(|events| tokio::spawn(log_network_events(events, peer_id.to_string())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let refresh = match network.relay() {
        Some(relay) => {
            info!("Requesting a reservation on relay {}", relay.peer_id());
            network.make_reservation()?;
            let state = network
                .wait_for_reservation(config.reservation_timeout())
                .await;
            match state {
                ReservationState::Active => info!("Relay reservation active"),
                _ if config.require_reservation => {
                    network.shutdown();
                    anyhow::bail!("relay reservation required but ended {state:?}");
                }
                _ => warn!(
                    ?state,
                    "Relay reservation unavailable, continuing with degraded connectivity"
                ),
            }
            Some(spawn_reservation_refresh(
                network.clone(),
                config.reservation_refresh_interval(),
                shutdown_rx.clone(),
            ))
        }
        None => {
            info!("No relay configured");
            None
        }
    };

    let rpc_addr = config.rpc_address();
    let listener = bind_listener(&rpc_addr).await?;
    let state = AppState {
        overlay: network.clone(),
        ledger,
        download_dir: config.download_dir.clone(),
        provider_timeout: config.provider_timeout(),
        peer_query_timeout: config.peer_query_timeout(),
        shutdown: shutdown_tx.clone(),
    };
    let mut server = tokio::spawn(serve(listener, state, shutdown_rx.clone()));

    info!("OrcaNet node is ready and running");
    info!("Admin API available at: http://{}", rpc_addr);

    let mut requested = shutdown_rx.clone();
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = requested.wait_for(|stop| *stop) => info!("Shutdown requested over the admin API"),
        result = &mut server => {
            network.shutdown();
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("admin server stopped unexpectedly")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(anyhow::anyhow!("admin server task failed: {err}")),
            };
        }
    }

    info!("Shutting down OrcaNet node");
    shutdown_tx.send_replace(true);

    match tokio::time::timeout(config.shutdown_grace(), &mut server).await {
        Ok(Ok(Ok(()))) => debug!("Admin API stopped"),
        Ok(Ok(Err(err))) => warn!("Admin API stopped with an error: {err:#}"),
        Ok(Err(err)) => warn!("Admin API task failed: {err}"),
        Err(_) => {
            warn!(
                "In-flight admin requests did not finish within {:?}, aborting",
                config.shutdown_grace()
            );
            server.abort();
        }
    }
    if let Some(refresh) = refresh {
        stop_task(refresh, "relay refresh").await;
    }

    network.shutdown();
    if let Some(logger) = event_logger {
        stop_task(logger, "event logger").await;
    }

    info!("OrcaNet node shutdown complete");
    Ok(())
}

async fn stop_task(handle: JoinHandle<()>, name: &str) {
    if let Err(err) = handle.await {
        if !err.is_cancelled() {
            error!("{name} task failed: {err}");
        }
    }
}

async fn log_network_events(mut events: mpsc::UnboundedReceiver<NetworkEvent>, peer_id: String) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::NewListenAddr { address } => {
                info!("Listening on {}/p2p/{}", address, peer_id);
            }
            NetworkEvent::PeerConnected { peer, address } => {
                info!(%peer, %address, "Peer connected");
            }
            NetworkEvent::PeerDisconnected { peer } => debug!(%peer, "Peer disconnected"),
            NetworkEvent::RelayReservationAccepted { relay } => {
                info!(%relay, "Relay reservation accepted");
            }
            NetworkEvent::RelayReservationFailed { relay, reason } => {
                warn!(%relay, "Relay reservation failed: {reason}");
            }
            NetworkEvent::HolePunchSucceeded { peer } => info!(%peer, "Direct connection established"),
            NetworkEvent::HolePunchFailed { peer, error } => {
                debug!(%peer, "Hole punch failed: {error}");
            }
            NetworkEvent::KnownPeersReceived { from, peers } => {
                debug!(%from, count = peers.len(), "Known peers received");
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("Cannot listen for SIGTERM: {err}");
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {err}");
                std::future::pending::<()>().await;
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Cannot listen for Ctrl-C: {err}");
                terminate.recv().await;
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}
