use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use orcanet_files::MetadataLedger;
use orcanet_p2p::{NetworkError, OverlayService};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::files::{handle_advertise, handle_file_transfer, handle_providers};

/// Everything the admin handlers need from the running node.
pub struct AppState {
    pub overlay: Arc<dyn OverlayService>,
    pub ledger: MetadataLedger,
    pub download_dir: PathBuf,
    /// Deadline for the provider lookup behind `/providers`.
    pub provider_timeout: Duration,
    /// Deadline for each provider's metadata answer.
    pub peer_query_timeout: Duration,
    pub shutdown: Arc<watch::Sender<bool>>,
}

pub(crate) type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct ShutdownResponse {
    status: &'static str,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub(crate) fn bad_gateway<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub(crate) fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<NetworkError> for ApiError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::NotFound { .. } => Self::not_found(err.to_string()),
            NetworkError::Request { .. }
            | NetworkError::RemoteFailure { .. }
            | NetworkError::ContentMismatch { .. }
            | NetworkError::Routing(_)
            | NetworkError::RelayUnavailable => Self::bad_gateway(err.to_string()),
            NetworkError::Validation(_) | NetworkError::RelayAddress(_) => {
                Self::bad_request(err.to_string())
            }
            NetworkError::ChannelClosed | NetworkError::Io(_) => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, "admin request failed: {}", self.message);
        }
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

/// Serve the admin API on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Admin API listening on http://{addr}");
    }
    let app = build_router(Arc::new(state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Admin API draining");
        })
        .await
        .context("admin server terminated unexpectedly")
}

pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind admin listener on {socket_addr}"))
    } else {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind admin listener on {addr}"))
    }
}

pub(crate) fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/advertise", post(handle_advertise))
        .route("/advertise/", post(handle_advertise))
        .route("/providers", get(handle_providers))
        .route("/providers/", get(handle_providers))
        .route("/file-transfer-request", post(handle_file_transfer))
        .route("/file-transfer-request/", post(handle_file_transfer))
        .route("/shutdown", post(handle_shutdown))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_root() -> &'static str {
    "OrcaNet node is running"
}

async fn handle_shutdown(State(state): State<SharedState>) -> Json<ShutdownResponse> {
    info!("shutdown requested over the admin API");
    state.shutdown.send_replace(true);
    Json(ShutdownResponse {
        status: "shutting down",
    })
}
