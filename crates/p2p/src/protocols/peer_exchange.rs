//! Push-style exchange of known peers (`/orcanet/p2p`).
//!
//! The sender writes one JSON line and the receiver writes nothing back.
//! On receipt every listed peer, except the relay and ourselves, is dialed
//! through the relay.

use super::{invalid_data, read_line, read_to_end_limited, MAX_LINE_LEN};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use libp2p::{PeerId, StreamProtocol};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::io;
use std::str::FromStr;

pub const PEER_EXCHANGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/orcanet/p2p");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    #[serde(default)]
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerExchangeMessage {
    #[serde(deserialize_with = "well_formed_entries")]
    pub known_peers: Vec<KnownPeer>,
}

/// Keep the entries that decode as a [`KnownPeer`] and drop the rest.
fn well_formed_entries<'de, D>(deserializer: D) -> Result<Vec<KnownPeer>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

impl PeerExchangeMessage {
    pub fn from_peers<'a>(peers: impl IntoIterator<Item = &'a PeerId>) -> Self {
        Self {
            known_peers: peers
                .into_iter()
                .map(|peer| KnownPeer {
                    peer_id: peer.to_string(),
                })
                .collect(),
        }
    }

    /// Peers worth dialing: parseable ids other than `relay` and `local`,
    /// without repeats.
    pub fn peers_to_contact(&self, relay: Option<&PeerId>, local: &PeerId) -> Vec<PeerId> {
        let mut seen = HashSet::new();
        self.known_peers
            .iter()
            .filter_map(|entry| PeerId::from_str(entry.peer_id.trim()).ok())
            .filter(|peer| Some(peer) != relay && peer != local)
            .filter(|peer| seen.insert(*peer))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerExchangeCodec;

#[async_trait]
impl request_response::Codec for PeerExchangeCodec {
    type Protocol = StreamProtocol;
    type Request = PeerExchangeMessage;
    type Response = ();

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let line = read_line(io, MAX_LINE_LEN).await?;
        serde_json::from_str(&line).map_err(invalid_data)
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        // Receivers never answer; drain whatever arrives until close.
        read_to_end_limited(io, MAX_LINE_LEN as u64).await?;
        Ok(())
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let mut payload = serde_json::to_vec(&request).map_err(invalid_data)?;
        payload.push(b'\n');
        io.write_all(&payload).await?;
        io.close().await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, _: ()) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.close().await
    }
}
