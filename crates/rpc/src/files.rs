//! Content endpoints: advertise a local file, look up providers, and fetch
//! a file from a peer.

use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use axum::extract::{Query, State};
use axum::Json;
use orcanet_files::{
    price_is_representable, AppendOutcome, ContentId, LedgerError, MetadataLedger, MetadataRecord,
};
use orcanet_p2p::{download_file, query_providers, DownloadedFile, MetadataQueryResponse, PeerId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::{ApiError, SharedState};

/// Query string of `POST /advertise`. Field names follow the web client.
#[derive(Debug, Default, Deserialize)]
pub struct AdvertiseParams {
    pub filepath: Option<String>,
    pub price: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub walletaddress: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdvertiseResponse {
    pub cid: ContentId,
    /// `advertised`, or `duplicate` when the ledger already held the CID.
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvidersParams {
    #[serde(rename = "targetCID")]
    pub target_cid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileTransferParams {
    #[serde(rename = "targetPeerID")]
    pub target_peer_id: Option<String>,
    pub cid: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing query parameter `{name}`")))
}

fn parse_cid(value: &str) -> Result<ContentId, ApiError> {
    ContentId::from_str(value).map_err(|err| ApiError::bad_request(err.to_string()))
}

fn parse_price(value: &str) -> Result<Decimal, ApiError> {
    let price = Decimal::from_str(value)
        .map_err(|err| ApiError::bad_request(format!("invalid price `{value}`: {err}")))?;
    if price < Decimal::ZERO {
        return Err(ApiError::bad_request("price must not be negative"));
    }
    if !price_is_representable(price) {
        return Err(ApiError::bad_request(format!(
            "price `{value}` has too many significant digits"
        )));
    }
    Ok(price)
}

/// Hash `path`, record it in the ledger, and return the outcome.
fn record_file(
    ledger: &MetadataLedger,
    path: PathBuf,
    price: Decimal,
    description: String,
    wallet_address: String,
) -> Result<(ContentId, AppendOutcome), ApiError> {
    let path = path.canonicalize().map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => {
            ApiError::not_found(format!("file not found: {}", path.display()))
        }
        _ => ApiError::bad_request(format!("cannot resolve {}: {err}", path.display())),
    })?;
    if !path.is_file() {
        return Err(ApiError::bad_request(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let bytes = std::fs::read(&path)
        .map_err(|err| ApiError::internal(format!("failed to read {}: {err}", path.display())))?;
    let cid = ContentId::from_data(&bytes).map_err(|err| ApiError::internal(err.to_string()))?;

    let record = MetadataRecord::new(cid, description, price, path, wallet_address);
    let outcome = ledger.append(record).map_err(|err| match err {
        LedgerError::InvalidRecord(reason) => ApiError::bad_request(reason),
        other => ApiError::internal(other.to_string()),
    })?;
    Ok((cid, outcome))
}

pub(crate) async fn handle_advertise(
    State(state): State<SharedState>,
    Query(params): Query<AdvertiseParams>,
) -> Result<Json<AdvertiseResponse>, ApiError> {
    let path = PathBuf::from(required(&params.filepath, "filepath")?);
    let price = parse_price(required(&params.price, "price")?)?;

    let ledger = state.ledger.clone();
    let AdvertiseParams {
        description,
        walletaddress,
        ..
    } = params;
    let (cid, outcome) = tokio::task::spawn_blocking(move || {
        record_file(&ledger, path, price, description, walletaddress)
    })
    .await
    .map_err(|err| ApiError::internal(format!("advertise task failed: {err}")))??;

    // Re-advertising a known file still refreshes the provider record.
    state.overlay.announce_provider(&cid).await?;

    let status = match outcome {
        AppendOutcome::Appended => "advertised",
        AppendOutcome::Duplicate => "duplicate",
    };
    info!(%cid, status, "file advertised");
    Ok(Json(AdvertiseResponse {
        cid,
        status: status.to_string(),
    }))
}

pub(crate) async fn handle_providers(
    State(state): State<SharedState>,
    Query(params): Query<ProvidersParams>,
) -> Result<Json<Vec<MetadataQueryResponse>>, ApiError> {
    let cid = parse_cid(required(&params.target_cid, "targetCID")?)?;

    let providers = state
        .overlay
        .find_providers(&cid, state.provider_timeout)
        .await?;
    debug!(%cid, count = providers.len(), "providers found");
    if providers.is_empty() {
        warn!(%cid, "no providers found");
    }

    let responses = query_providers(
        state.overlay.as_ref(),
        &cid,
        providers,
        state.peer_query_timeout,
    )
    .await;
    Ok(Json(responses))
}

pub(crate) async fn handle_file_transfer(
    State(state): State<SharedState>,
    Query(params): Query<FileTransferParams>,
) -> Result<Json<DownloadedFile>, ApiError> {
    let peer_text = required(&params.target_peer_id, "targetPeerID")?;
    let peer = PeerId::from_str(peer_text)
        .map_err(|err| ApiError::bad_request(format!("invalid peer id `{peer_text}`: {err}")))?;
    let cid = parse_cid(required(&params.cid, "cid")?)?;

    let downloaded = download_file(state.overlay.as_ref(), peer, &cid, &state.download_dir).await?;
    Ok(Json(downloaded))
}
