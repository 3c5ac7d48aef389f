//! Router-level tests for the content endpoints.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use orcanet_files::{ContentId, MetadataLedger, MetadataRecord};
use orcanet_p2p::{
    FileTransferResponse, MetadataQueryResponse, NetworkError, OverlayService, PeerId,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

use crate::server::{build_router, AppState};

/// Overlay stand-in that answers from fixed tables.
#[derive(Default)]
pub(crate) struct FakeOverlay {
    pub(crate) local: Option<PeerId>,
    pub(crate) providers: HashSet<PeerId>,
    pub(crate) metadata: HashMap<PeerId, MetadataQueryResponse>,
    pub(crate) files: HashMap<PeerId, FileTransferResponse>,
    pub(crate) unroutable: bool,
    pub(crate) announced: Mutex<Vec<ContentId>>,
}

#[async_trait]
impl OverlayService for FakeOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.local.unwrap_or_else(PeerId::random)
    }

    async fn announce_provider(&self, cid: &ContentId) -> Result<(), NetworkError> {
        if self.unroutable {
            return Err(NetworkError::Routing("no peers in routing table".into()));
        }
        self.announced.lock().push(*cid);
        Ok(())
    }

    async fn find_providers(
        &self,
        _: &ContentId,
        _: Duration,
    ) -> Result<HashSet<PeerId>, NetworkError> {
        Ok(self.providers.clone())
    }

    async fn query_metadata(
        &self,
        peer: PeerId,
        _: &ContentId,
    ) -> Result<MetadataQueryResponse, NetworkError> {
        self.metadata.get(&peer).cloned().ok_or(NetworkError::Request {
            peer,
            reason: "connection refused".into(),
        })
    }

    async fn request_file(
        &self,
        peer: PeerId,
        _: &ContentId,
    ) -> Result<FileTransferResponse, NetworkError> {
        self.files.get(&peer).cloned().ok_or(NetworkError::Request {
            peer,
            reason: "connection refused".into(),
        })
    }
}

/// State over `overlay` with a ledger and download dir in a fresh temp dir.
pub(crate) fn test_state(overlay: FakeOverlay) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = MetadataLedger::open(dir.path(), "rpc-test").unwrap();
    let (shutdown, _) = watch::channel(false);
    let state = AppState {
        overlay: Arc::new(overlay),
        ledger,
        download_dir: dir.path().join("downloads"),
        provider_timeout: Duration::from_secs(1),
        peer_query_timeout: Duration::from_secs(1),
        shutdown: Arc::new(shutdown),
    };
    (state, dir)
}

pub(crate) async fn read_json(response: Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

async fn call(state: Arc<AppState>, method: &str, uri: &str) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    build_router(state).oneshot(request).await.unwrap()
}

fn write_file(dir: &Path, name: &str, data: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path.display().to_string()
}

fn metadata_from(peer: PeerId, cid: ContentId, price: &str) -> MetadataQueryResponse {
    MetadataQueryResponse {
        peer_id: peer.to_string(),
        node_info: "remote".into(),
        metadata: vec![MetadataRecord::new(
            cid,
            "remote copy",
            Decimal::from_str(price).unwrap(),
            "/srv/share/remote.bin",
            "wallet-r",
        )],
    }
}

#[tokio::test]
async fn advertise_records_and_announces() {
    let (state, dir) = test_state(FakeOverlay::default());
    let state = Arc::new(state);
    let path = write_file(dir.path(), "song.mp3", b"some audio");
    let expected = ContentId::from_data(b"some audio").unwrap();

    let uri = format!("/advertise?filepath={path}&price=2.50&description=demo&walletaddress=w1");
    let response = call(state.clone(), "POST", &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["cid"], expected.to_string());
    assert_eq!(body["status"], "advertised");

    let records = state.ledger.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].price, Decimal::from_str("2.50").unwrap());
    assert_eq!(records[0].description, "demo");
    assert_eq!(records[0].wallet_address, "w1");
    assert!(records[0].file_path.is_absolute());
}

#[tokio::test]
async fn advertising_twice_reports_duplicate_and_reannounces() {
    let (state, dir) = test_state(FakeOverlay::default());
    let state = Arc::new(state);
    let path = write_file(dir.path(), "twice.txt", b"same bytes");
    let uri = format!("/advertise/?filepath={path}&price=1");

    let first = read_json(call(state.clone(), "POST", &uri).await).await;
    let second = read_json(call(state.clone(), "POST", &uri).await).await;
    assert_eq!(first["status"], "advertised");
    assert_eq!(second["status"], "duplicate");
    assert_eq!(state.ledger.len(), 1);
}

#[tokio::test]
async fn advertise_validates_its_parameters() {
    let (state, dir) = test_state(FakeOverlay::default());
    let state = Arc::new(state);
    let path = write_file(dir.path(), "priced.txt", b"priced");

    let missing_price = call(state.clone(), "POST", &format!("/advertise?filepath={path}")).await;
    assert_eq!(missing_price.status(), StatusCode::BAD_REQUEST);
    assert!(read_json(missing_price).await["error"]
        .as_str()
        .unwrap()
        .contains("price"));

    let negative = call(
        state.clone(),
        "POST",
        &format!("/advertise?filepath={path}&price=-1"),
    )
    .await;
    assert_eq!(negative.status(), StatusCode::BAD_REQUEST);

    let garbage = call(
        state.clone(),
        "POST",
        &format!("/advertise?filepath={path}&price=cheap"),
    )
    .await;
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let too_precise = call(
        state.clone(),
        "POST",
        &format!("/advertise?filepath={path}&price=12345678901234567.89"),
    )
    .await;
    assert_eq!(too_precise.status(), StatusCode::BAD_REQUEST);
    assert!(read_json(too_precise).await["error"]
        .as_str()
        .unwrap()
        .contains("significant digits"));

    let directory = call(
        state.clone(),
        "POST",
        &format!("/advertise?filepath={}&price=1", dir.path().display()),
    )
    .await;
    assert_eq!(directory.status(), StatusCode::BAD_REQUEST);

    assert!(state.ledger.is_empty());
}

#[tokio::test]
async fn advertising_a_missing_file_is_not_found() {
    let (state, dir) = test_state(FakeOverlay::default());
    let missing = dir.path().join("nope.bin");
    let uri = format!("/advertise?filepath={}&price=1", missing.display());

    let response = call(Arc::new(state), "POST", &uri).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn announce_failure_is_a_bad_gateway() {
    let (state, dir) = test_state(FakeOverlay {
        unroutable: true,
        ..FakeOverlay::default()
    });
    let state = Arc::new(state);
    let path = write_file(dir.path(), "lonely.txt", b"no peers");

    let response = call(
        state.clone(),
        "POST",
        &format!("/advertise?filepath={path}&price=0"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    // The record stays so a retry can re-announce it.
    assert_eq!(state.ledger.len(), 1);
}

#[tokio::test]
async fn providers_returns_remote_metadata_only() {
    let local = PeerId::random();
    let remote = PeerId::random();
    let silent = PeerId::random();
    let cid = ContentId::from_data(b"popular").unwrap();
    let overlay = FakeOverlay {
        local: Some(local),
        providers: [local, remote, silent].into_iter().collect(),
        metadata: [(remote, metadata_from(remote, cid, "2.50"))]
            .into_iter()
            .collect(),
        ..FakeOverlay::default()
    };
    let (state, _dir) = test_state(overlay);

    let response = call(
        Arc::new(state),
        "GET",
        &format!("/providers?targetCID={cid}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["peer_id"], remote.to_string());
    assert_eq!(entries[0]["metadata"][0]["price"], 2.5);
    assert_eq!(entries[0]["metadata"][0]["cid"], cid.to_string());
}

#[tokio::test]
async fn providers_rejects_a_bad_cid() {
    let (state, _dir) = test_state(FakeOverlay::default());
    let state = Arc::new(state);

    let missing = call(state.clone(), "GET", "/providers/").await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let garbled = call(state, "GET", "/providers?targetCID=not-a-cid").await;
    assert_eq!(garbled.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn file_transfer_downloads_into_the_download_dir() {
    let peer = PeerId::random();
    let data = b"downloaded payload".to_vec();
    let cid = ContentId::from_data(&data).unwrap();
    let overlay = FakeOverlay {
        files: [(peer, FileTransferResponse::Found(data.clone()))]
            .into_iter()
            .collect(),
        ..FakeOverlay::default()
    };
    let (state, _dir) = test_state(overlay);
    let state = Arc::new(state);

    let uri = format!("/file-transfer-request?targetPeerID={peer}&cid={cid}");
    let response = call(state.clone(), "POST", &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["bytes"], data.len() as u64);

    let written = state.download_dir.join(cid.to_string());
    assert_eq!(body["path"], written.display().to_string());
    assert_eq!(std::fs::read(written).unwrap(), data);
}

#[tokio::test]
async fn file_transfer_maps_peer_outcomes() {
    let missing = PeerId::random();
    let unreachable = PeerId::random();
    let cid = ContentId::from_data(b"elsewhere").unwrap();
    let overlay = FakeOverlay {
        files: [(missing, FileTransferResponse::NotFound)]
            .into_iter()
            .collect(),
        ..FakeOverlay::default()
    };
    let (state, _dir) = test_state(overlay);
    let state = Arc::new(state);

    let not_found = call(
        state.clone(),
        "POST",
        &format!("/file-transfer-request/?targetPeerID={missing}&cid={cid}"),
    )
    .await;
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

    let gateway = call(
        state.clone(),
        "POST",
        &format!("/file-transfer-request?targetPeerID={unreachable}&cid={cid}"),
    )
    .await;
    assert_eq!(gateway.status(), StatusCode::BAD_GATEWAY);

    let bad_peer = call(
        state,
        "POST",
        &format!("/file-transfer-request?targetPeerID=bogus&cid={cid}"),
    )
    .await;
    assert_eq!(bad_peer.status(), StatusCode::BAD_REQUEST);
}
