//! The task that owns the swarm.

use crate::behaviour::{ComposedBehaviour, ComposedEvent};
use crate::config::NetworkConfig;
use crate::network::{Command, NetworkEvent, Reply};
use crate::protocols::{
    FileTransferRequest, FileTransferResponse, MetadataQueryRequest, MetadataQueryResponse,
    PeerExchangeMessage,
};
use crate::relay::{RelayTarget, ReservationState};
use crate::validator::NamespacedValidator;
use crate::NetworkError;
use futures::StreamExt;
use libp2p::kad::store::RecordStore;
use libp2p::kad::{self, GetProvidersOk, GetRecordOk, QueryId, QueryResult};
use libp2p::request_response::{self, Message, OutboundRequestId, ResponseChannel};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::core::transport::ListenerId;
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{identify, relay, upnp, Multiaddr, PeerId, Swarm};
use orcanet_files::{ContentId, MetadataLedger};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outcome of a file read done off the swarm task.
struct FileRead {
    peer: PeerId,
    cid: ContentId,
    channel: ResponseChannel<FileTransferResponse>,
    response: FileTransferResponse,
}

pub(crate) struct EventLoop {
    swarm: Swarm<ComposedBehaviour>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    listen_addresses: Arc<RwLock<HashSet<Multiaddr>>>,

    relay: Option<RelayTarget>,
    reservation_tx: watch::Sender<ReservationState>,
    reservation_listener: Option<ListenerId>,

    ledger: MetadataLedger,
    validator: NamespacedValidator,
    node_info: String,
    max_transfer_bytes: u64,
    connected: HashSet<PeerId>,

    pending_provide: HashMap<QueryId, Reply<()>>,
    pending_providers: HashMap<QueryId, mpsc::UnboundedSender<HashSet<PeerId>>>,
    pending_put: HashMap<QueryId, Reply<()>>,
    pending_get: HashMap<QueryId, Reply<Option<Vec<u8>>>>,
    pending_metadata: HashMap<OutboundRequestId, Reply<MetadataQueryResponse>>,
    pending_files: HashMap<OutboundRequestId, Reply<FileTransferResponse>>,
    pending_push: HashMap<OutboundRequestId, (usize, Reply<usize>)>,

    file_reads_tx: mpsc::UnboundedSender<FileRead>,
    file_reads_rx: mpsc::UnboundedReceiver<FileRead>,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        swarm: Swarm<ComposedBehaviour>,
        command_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        listen_addresses: Arc<RwLock<HashSet<Multiaddr>>>,
        reservation_tx: watch::Sender<ReservationState>,
        relay: Option<RelayTarget>,
        ledger: MetadataLedger,
        validator: NamespacedValidator,
        config: &NetworkConfig,
    ) -> Self {
        let (file_reads_tx, file_reads_rx) = mpsc::unbounded_channel();
        Self {
            swarm,
            command_rx,
            event_tx,
            listen_addresses,
            relay,
            reservation_tx,
            reservation_listener: None,
            ledger,
            validator,
            node_info: config.node_info.clone(),
            max_transfer_bytes: config.max_transfer_bytes,
            connected: HashSet::new(),
            pending_provide: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_put: HashMap::new(),
            pending_get: HashMap::new(),
            pending_metadata: HashMap::new(),
            pending_files: HashMap::new(),
            pending_push: HashMap::new(),
            file_reads_tx,
            file_reads_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.command_rx.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        debug!("Shutting down overlay swarm");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(read) = self.file_reads_rx.recv() => self.finish_file_read(read),
            }
        }
        info!("overlay swarm task terminated");
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.event_tx.send(event);
    }

    fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    fn set_reservation(&self, state: ReservationState) {
        self.reservation_tx.send_replace(state);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ConnectViaRelay { peer } => self.connect_via_relay(peer),
            Command::MakeReservation => self.make_reservation(),
            Command::StartProviding { key, reply } => {
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(id) => {
                        self.pending_provide.insert(id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(NetworkError::Routing(err.to_string())));
                    }
                }
            }
            Command::FindProviders { key, found } => {
                let id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending_providers.insert(id, found);
            }
            Command::PutRecord { record, reply } => {
                if let Err(err) = self.validator.validate(&record) {
                    let _ = reply.send(Err(err.into()));
                    return;
                }
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .put_record(record, kad::Quorum::One)
                {
                    Ok(id) => {
                        self.pending_put.insert(id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(NetworkError::Routing(err.to_string())));
                    }
                }
            }
            Command::GetRecord { key, reply } => {
                let id = self.swarm.behaviour_mut().kademlia.get_record(key);
                self.pending_get.insert(id, reply);
            }
            Command::QueryMetadata { peer, cid, reply } => {
                self.ensure_route(peer);
                let id = self
                    .swarm
                    .behaviour_mut()
                    .metadata_query
                    .send_request(&peer, MetadataQueryRequest { cid });
                self.pending_metadata.insert(id, reply);
            }
            Command::RequestFile { peer, cid, reply } => {
                self.ensure_route(peer);
                let request = FileTransferRequest {
                    requester: self.local_peer_id().to_string(),
                    cid,
                };
                let id = self
                    .swarm
                    .behaviour_mut()
                    .file_transfer
                    .send_request(&peer, request);
                self.pending_files.insert(id, reply);
            }
            Command::PushKnownPeers { peer, reply } => {
                self.ensure_route(peer);
                let message =
                    PeerExchangeMessage::from_peers(self.connected.iter().filter(|p| **p != peer));
                let listed = message.known_peers.len();
                let id = self
                    .swarm
                    .behaviour_mut()
                    .peer_exchange
                    .send_request(&peer, message);
                self.pending_push.insert(id, (listed, reply));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.connected.iter().copied().collect());
            }
            Command::Shutdown => {}
        }
    }

    /// Give the swarm a circuit address for `peer` when we have no connection.
    fn ensure_route(&mut self, peer: PeerId) {
        if self.connected.contains(&peer) {
            return;
        }
        if let Some(relay) = &self.relay {
            if peer != relay.peer_id() {
                let address = relay.circuit_address(peer);
                self.swarm.add_peer_address(peer, address);
            }
        }
    }

    fn connect_via_relay(&mut self, peer: PeerId) {
        let Some(relay) = &self.relay else {
            debug!(%peer, "no relay configured, not dialing through a circuit");
            return;
        };
        if peer == relay.peer_id() || peer == self.local_peer_id() {
            return;
        }

        let address = relay.circuit_address(peer);
        self.swarm.add_peer_address(peer, address.clone());
        let opts = DialOpts::peer_id(peer)
            .addresses(vec![address.clone()])
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => debug!(%peer, %address, "dialing through relay"),
            Err(DialError::DialPeerConditionFalse(_)) => {}
            Err(err) => warn!(%peer, "dial through relay failed: {err}"),
        }
    }

    fn make_reservation(&mut self) {
        let Some(relay) = self.relay.clone() else {
            return;
        };
        if let Some(previous) = self.reservation_listener.take() {
            self.swarm.remove_listener(previous);
        }
        match self.swarm.listen_on(relay.listen_address()) {
            Ok(id) => {
                info!(relay = %relay.peer_id(), "requesting relay reservation");
                self.reservation_listener = Some(id);
                self.set_reservation(ReservationState::Pending);
            }
            Err(err) => {
                warn!(relay = %relay.peer_id(), "relay reservation failed: {err}");
                self.set_reservation(ReservationState::Failed);
                self.emit(NetworkEvent::RelayReservationFailed {
                    relay: relay.peer_id(),
                    reason: err.to_string(),
                });
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ComposedEvent>) {
        match event {
            SwarmEvent::Behaviour(ComposedEvent::Kademlia(event)) => self.on_kademlia(event),
            SwarmEvent::Behaviour(ComposedEvent::PeerExchange(event)) => {
                self.on_peer_exchange(event)
            }
            SwarmEvent::Behaviour(ComposedEvent::MetadataQuery(event)) => {
                self.on_metadata_query(event)
            }
            SwarmEvent::Behaviour(ComposedEvent::FileTransfer(event)) => {
                self.on_file_transfer(event)
            }
            SwarmEvent::Behaviour(ComposedEvent::Identify(event)) => {
                if let identify::Event::Received { peer_id, info, .. } = event {
                    let speaks_kad = info.protocols.iter().any(|p| *p == kad::PROTOCOL_NAME);
                    if speaks_kad {
                        for addr in info.listen_addrs {
                            self.swarm
                                .behaviour_mut()
                                .kademlia
                                .add_address(&peer_id, addr);
                        }
                    }
                }
            }
            SwarmEvent::Behaviour(ComposedEvent::RelayClient(event)) => match event {
                relay::client::Event::ReservationReqAccepted {
                    relay_peer_id,
                    renewal,
                    ..
                } => {
                    info!(relay = %relay_peer_id, renewal, "relay reservation accepted");
                    self.set_reservation(ReservationState::Active);
                    self.emit(NetworkEvent::RelayReservationAccepted {
                        relay: relay_peer_id,
                    });
                }
                other => debug!(?other, "relay client event"),
            },
            SwarmEvent::Behaviour(ComposedEvent::RelayServer(event)) => {
                debug!(?event, "relay server event");
            }
            SwarmEvent::Behaviour(ComposedEvent::Dcutr(event)) => {
                let remote_peer_id = event.remote_peer_id;
                match event.result {
                    Ok(_) => {
                        info!(peer = %remote_peer_id, "hole punch succeeded");
                        self.emit(NetworkEvent::HolePunchSucceeded {
                            peer: remote_peer_id,
                        });
                    }
                    Err(err) => {
                        debug!(peer = %remote_peer_id, "hole punch failed: {err}");
                        self.emit(NetworkEvent::HolePunchFailed {
                            peer: remote_peer_id,
                            error: err.to_string(),
                        });
                    }
                }
            }
            SwarmEvent::Behaviour(ComposedEvent::Upnp(event)) => match event {
                upnp::Event::NewExternalAddr(address) => {
                    info!(%address, "UPnP mapped external address");
                }
                other => debug!(?other, "upnp event"),
            },
            SwarmEvent::Behaviour(ComposedEvent::Ping(_)) => {}
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                self.connected.insert(peer_id);
                if num_established.get() == 1 {
                    let address = endpoint.get_remote_address().clone();
                    info!(peer = %peer_id, %address, "New peer connected");
                    self.emit(NetworkEvent::PeerConnected {
                        peer: peer_id,
                        address,
                    });
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.connected.remove(&peer_id);
                    debug!(peer = %peer_id, "peer disconnected");
                    self.emit(NetworkEvent::PeerDisconnected { peer: peer_id });
                }
            }
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                if Some(listener_id) == self.reservation_listener {
                    info!(%address, "reachable through relay circuit");
                } else {
                    info!("Listening on {address}");
                }
                self.listen_addresses.write().insert(address.clone());
                self.emit(NetworkEvent::NewListenAddr { address });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addresses.write().remove(&address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                addresses,
                reason,
            } => {
                for address in &addresses {
                    self.listen_addresses.write().remove(address);
                }
                if Some(listener_id) == self.reservation_listener {
                    self.reservation_listener = None;
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(err) => err.to_string(),
                    };
                    warn!("relay reservation lost: {reason}");
                    self.set_reservation(ReservationState::Failed);
                    if let Some(relay) = &self.relay {
                        self.emit(NetworkEvent::RelayReservationFailed {
                            relay: relay.peer_id(),
                            reason,
                        });
                    }
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                if Some(listener_id) == self.reservation_listener {
                    warn!("relay circuit listener error: {error}");
                } else {
                    debug!("listener error: {error}");
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(peer = ?peer_id, "outgoing connection error: {error}");
            }
            _ => {}
        }
    }

    fn on_kademlia(&mut self, event: kad::Event) {
        match event {
            kad::Event::InboundRequest { request } => match request {
                kad::InboundRequest::PutRecord {
                    source,
                    record: Some(record),
                    ..
                } => match self.validator.validate(&record) {
                    Ok(()) => {
                        if let Err(err) = self.swarm.behaviour_mut().kademlia.store_mut().put(record)
                        {
                            warn!(peer = %source, "failed to store record: {err}");
                        }
                    }
                    Err(err) => warn!(peer = %source, "rejected record: {err}"),
                },
                kad::InboundRequest::AddProvider {
                    record: Some(record),
                } => {
                    if let Err(err) = self
                        .swarm
                        .behaviour_mut()
                        .kademlia
                        .store_mut()
                        .add_provider(record)
                    {
                        warn!("failed to store provider record: {err}");
                    }
                }
                _ => {}
            },
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => {
                self.on_query_result(id, result);
                if step.last {
                    self.finish_query(id);
                }
            }
            _ => {}
        }
    }

    fn on_query_result(&mut self, id: QueryId, result: QueryResult) {
        match result {
            QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_provide.remove(&id) {
                    let result = result
                        .map(|_| ())
                        .map_err(|err| NetworkError::Routing(err.to_string()));
                    let _ = reply.send(result);
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                let receiver_gone = match self.pending_providers.get(&id) {
                    Some(found) => found.send(providers).is_err(),
                    None => false,
                };
                if receiver_gone {
                    // The caller's deadline passed; stop walking the DHT.
                    self.pending_providers.remove(&id);
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            })) => {}
            QueryResult::GetProviders(Err(err)) => {
                debug!("provider lookup ended: {err}");
            }
            QueryResult::PutRecord(result) => {
                if let Some(reply) = self.pending_put.remove(&id) {
                    let result = result
                        .map(|_| ())
                        .map_err(|err| NetworkError::Routing(err.to_string()));
                    let _ = reply.send(result);
                }
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(found))) => {
                if !self.pending_get.contains_key(&id) {
                    return;
                }
                match self.validator.validate(&found.record) {
                    Ok(()) => {
                        if let Some(reply) = self.pending_get.remove(&id) {
                            let _ = reply.send(Ok(Some(found.record.value)));
                        }
                        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id)
                        {
                            query.finish();
                        }
                    }
                    Err(err) => warn!(peer = ?found.peer, "ignoring invalid record: {err}"),
                }
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FinishedWithNoAdditionalRecord { .. }))
            | QueryResult::GetRecord(Err(kad::GetRecordError::NotFound { .. })) => {
                if let Some(reply) = self.pending_get.remove(&id) {
                    let _ = reply.send(Ok(None));
                }
            }
            QueryResult::GetRecord(Err(err)) => {
                if let Some(reply) = self.pending_get.remove(&id) {
                    let _ = reply.send(Err(NetworkError::Routing(err.to_string())));
                }
            }
            QueryResult::Bootstrap(result) => {
                debug!(?result, "DHT bootstrap progressed");
            }
            _ => {}
        }
    }

    /// Drop whatever is still waiting on a query that will not progress again.
    fn finish_query(&mut self, id: QueryId) {
        self.pending_providers.remove(&id);
        if let Some(reply) = self.pending_get.remove(&id) {
            let _ = reply.send(Ok(None));
        }
        if let Some(reply) = self.pending_provide.remove(&id) {
            let _ = reply.send(Err(NetworkError::Routing("query ended without result".into())));
        }
        if let Some(reply) = self.pending_put.remove(&id) {
            let _ = reply.send(Err(NetworkError::Routing("query ended without result".into())));
        }
    }

    fn on_peer_exchange(&mut self, event: request_response::Event<PeerExchangeMessage, ()>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                Message::Request {
                    request, channel, ..
                } => {
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .peer_exchange
                        .send_response(channel, ());
                    let relay_id = self.relay.as_ref().map(RelayTarget::peer_id);
                    let peers = request.peers_to_contact(relay_id.as_ref(), &self.local_peer_id());
                    debug!(from = %peer, count = peers.len(), "received known peers");
                    for known in &peers {
                        self.connect_via_relay(*known);
                    }
                    self.emit(NetworkEvent::KnownPeersReceived { from: peer, peers });
                }
                Message::Response { request_id, .. } => {
                    if let Some((listed, reply)) = self.pending_push.remove(&request_id) {
                        let _ = reply.send(Ok(listed));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(%peer, "peer exchange push failed: {error}");
                if let Some((_, reply)) = self.pending_push.remove(&request_id) {
                    let _ = reply.send(Err(NetworkError::Request {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(%peer, "dropped peer exchange message: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_metadata_query(
        &mut self,
        event: request_response::Event<MetadataQueryRequest, MetadataQueryResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                Message::Request {
                    request, channel, ..
                } => {
                    let metadata = self.ledger.records_for(&request.cid);
                    debug!(%peer, cid = %request.cid, records = metadata.len(), "answering metadata query");
                    let response = MetadataQueryResponse {
                        peer_id: self.local_peer_id().to_string(),
                        node_info: self.node_info.clone(),
                        metadata,
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .metadata_query
                        .send_response(channel, response)
                        .is_err()
                    {
                        warn!(%peer, "metadata query stream closed before response");
                    }
                }
                Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_metadata.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(%peer, "metadata query failed: {error}");
                if let Some(reply) = self.pending_metadata.remove(&request_id) {
                    let _ = reply.send(Err(NetworkError::Request {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(%peer, "inbound metadata query failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_file_transfer(
        &mut self,
        event: request_response::Event<FileTransferRequest, FileTransferResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                Message::Request {
                    request, channel, ..
                } => {
                    let cid = request.cid;
                    info!(%peer, requester = %request.requester, %cid, "file requested");
                    let Some(path) = self.ledger.lookup_by_identifier(&cid) else {
                        debug!(%peer, %cid, "requested file is not advertised here");
                        let _ = self
                            .swarm
                            .behaviour_mut()
                            .file_transfer
                            .send_response(channel, FileTransferResponse::NotFound);
                        return;
                    };

                    let reads = self.file_reads_tx.clone();
                    let max_bytes = self.max_transfer_bytes;
                    tokio::spawn(async move {
                        let response = read_for_transfer(&path, max_bytes).await;
                        let _ = reads.send(FileRead {
                            peer,
                            cid,
                            channel,
                            response,
                        });
                    });
                }
                Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_files.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(%peer, "file request failed: {error}");
                if let Some(reply) = self.pending_files.remove(&request_id) {
                    let _ = reply.send(Err(NetworkError::Request {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(%peer, "inbound file request failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn finish_file_read(&mut self, read: FileRead) {
        let FileRead {
            peer,
            cid,
            channel,
            response,
        } = read;
        if let FileTransferResponse::Found(bytes) = &response {
            info!(%peer, %cid, bytes = bytes.len(), "sending file");
        }
        if self
            .swarm
            .behaviour_mut()
            .file_transfer
            .send_response(channel, response)
            .is_err()
        {
            warn!(%peer, %cid, "file transfer stream closed before response");
        }
    }
}

async fn read_for_transfer(path: &Path, max_bytes: u64) -> FileTransferResponse {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > max_bytes => {
            warn!(path = %path.display(), size = meta.len(), "file exceeds transfer limit");
            FileTransferResponse::Failed
        }
        Ok(_) => match tokio::fs::read(path).await {
            Ok(bytes) => FileTransferResponse::Found(bytes),
            Err(err) => {
                warn!(path = %path.display(), "failed to read advertised file: {err}");
                FileTransferResponse::Failed
            }
        },
        Err(err) => {
            warn!(path = %path.display(), "advertised file is unavailable: {err}");
            FileTransferResponse::Failed
        }
    }
}
