//! Metadata query (`/cid-get/1.0.0`).
//!
//! The requester writes `<cid>\n`; the responder answers with the records
//! its ledger holds for that identifier and closes.

use super::{invalid_data, read_line, read_to_end_limited, MAX_LINE_LEN};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use libp2p::StreamProtocol;
use orcanet_files::{ContentId, MetadataRecord};
use serde::{Deserialize, Deserializer, Serialize};
use std::io;

pub const METADATA_QUERY_PROTOCOL: StreamProtocol = StreamProtocol::new("/cid-get/1.0.0");

/// Largest metadata response accepted from a peer.
const MAX_RESPONSE_LEN: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQueryRequest {
    pub cid: ContentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQueryResponse {
    pub peer_id: String,
    #[serde(default)]
    pub node_info: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Vec<MetadataRecord>,
}

// Some peers encode an empty record list as `null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<MetadataRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<MetadataRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default)]
pub struct MetadataQueryCodec;

#[async_trait]
impl request_response::Codec for MetadataQueryCodec {
    type Protocol = StreamProtocol;
    type Request = MetadataQueryRequest;
    type Response = MetadataQueryResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let line = read_line(io, MAX_LINE_LEN).await?;
        let cid = line.parse::<ContentId>().map_err(invalid_data)?;
        Ok(MetadataQueryRequest { cid })
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_to_end_limited(io, MAX_RESPONSE_LEN).await?;
        serde_json::from_slice(&buf).map_err(invalid_data)
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
        io.write_all(format!("{}\n", request.cid).as_bytes()).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let payload = serde_json::to_vec(&response).map_err(invalid_data)?;
        io.write_all(&payload).await?;
        io.close().await
    }
}
