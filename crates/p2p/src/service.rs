//! Overlay operations consumed by the admin surface.
//!
//! [`OverlayService`] is the seam between the HTTP layer and the swarm so
//! handlers can be exercised against an in-memory stand-in.

use crate::network::OverlayNetwork;
use crate::protocols::{FileTransferResponse, MetadataQueryResponse};
use crate::NetworkError;
use async_trait::async_trait;
use futures::future::join_all;
use libp2p::PeerId;
use orcanet_files::ContentId;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait OverlayService: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    async fn announce_provider(&self, cid: &ContentId) -> Result<(), NetworkError>;

    async fn find_providers(
        &self,
        cid: &ContentId,
        timeout: Duration,
    ) -> Result<HashSet<PeerId>, NetworkError>;

    async fn query_metadata(
        &self,
        peer: PeerId,
        cid: &ContentId,
    ) -> Result<MetadataQueryResponse, NetworkError>;

    async fn request_file(
        &self,
        peer: PeerId,
        cid: &ContentId,
    ) -> Result<FileTransferResponse, NetworkError>;
}

#[async_trait]
impl OverlayService for OverlayNetwork {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id()
    }

    async fn announce_provider(&self, cid: &ContentId) -> Result<(), NetworkError> {
        OverlayNetwork::announce_provider(self, cid).await
    }

    async fn find_providers(
        &self,
        cid: &ContentId,
        timeout: Duration,
    ) -> Result<HashSet<PeerId>, NetworkError> {
        OverlayNetwork::find_providers(self, cid, timeout).await
    }

    async fn query_metadata(
        &self,
        peer: PeerId,
        cid: &ContentId,
    ) -> Result<MetadataQueryResponse, NetworkError> {
        OverlayNetwork::query_metadata(self, peer, cid).await
    }

    async fn request_file(
        &self,
        peer: PeerId,
        cid: &ContentId,
    ) -> Result<FileTransferResponse, NetworkError> {
        OverlayNetwork::request_file(self, peer, cid).await
    }
}

/// Query every provider for its records about `cid` concurrently.
///
/// Each peer gets `per_peer_timeout`. Peers that fail or time out, and the
/// local node, are left out of the result.
pub async fn query_providers(
    service: &dyn OverlayService,
    cid: &ContentId,
    providers: impl IntoIterator<Item = PeerId>,
    per_peer_timeout: Duration,
) -> Vec<MetadataQueryResponse> {
    let local = service.local_peer_id();
    let queries = providers
        .into_iter()
        .filter(|peer| *peer != local)
        .map(|peer| async move {
            match tokio::time::timeout(per_peer_timeout, service.query_metadata(peer, cid)).await {
                Ok(Ok(response)) => Some(response),
                Ok(Err(err)) => {
                    warn!(%peer, %cid, "metadata query failed: {err}");
                    None
                }
                Err(_) => {
                    warn!(%peer, %cid, "metadata query timed out");
                    None
                }
            }
        });

    join_all(queries).await.into_iter().flatten().collect()
}

/// A file fetched from a peer and written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedFile {
    pub cid: ContentId,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Fetch `cid` from `peer` into `<download_dir>/<cid>`, replacing any
/// existing file. The payload must hash to `cid`.
pub async fn download_file(
    service: &dyn OverlayService,
    peer: PeerId,
    cid: &ContentId,
    download_dir: &Path,
) -> Result<DownloadedFile, NetworkError> {
    let bytes = match service.request_file(peer, cid).await? {
        FileTransferResponse::Found(bytes) => bytes,
        FileTransferResponse::NotFound => return Err(NetworkError::NotFound { peer, cid: *cid }),
        FileTransferResponse::Failed => {
            return Err(NetworkError::RemoteFailure { peer, cid: *cid })
        }
    };

    let received = ContentId::from_data(&bytes)
        .map_err(|err| NetworkError::Io(std::io::Error::other(err)))?;
    if received != *cid {
        return Err(NetworkError::ContentMismatch {
            peer,
            expected: *cid,
            received,
        });
    }

    tokio::fs::create_dir_all(download_dir).await?;
    let path = download_dir.join(cid.to_string());
    tokio::fs::write(&path, &bytes).await?;
    info!(%peer, %cid, path = %path.display(), bytes = bytes.len(), "file downloaded");

    Ok(DownloadedFile {
        cid: *cid,
        path,
        bytes: bytes.len() as u64,
    })
}
