//! Burrow API -- small HTTP surface served next to a server node.
//!
//! - `GET /info/p2p`: the node's best local and public multiaddr, queried by
//!   clients before they dial.
//! - `POST /relays/found`: an external discovery layer reports a peer key that
//!   may be a relay.
//! - `GET /status`: peer id, uptime, active relays.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use burrow_protocol::{InfoResponse, P2pInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Answers "my best current local and public reachable address".
pub trait AddressSource: Send + Sync {
    fn p2p_info(&self) -> P2pInfo;
}

/// Callback returning the relays the node currently listens through.
pub type RelayListFn = Box<
    dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<String>> + Send>>
        + Send
        + Sync,
>;

/// Shared state for all API handlers.
pub struct AppState {
    pub peer_id: String,
    pub start_time: std::time::Instant,
    pub addresses: Arc<dyn AddressSource>,
    /// Forwards reported peer keys into the relay pipeline.
    pub relays_found: Option<tokio::sync::mpsc::Sender<String>>,
    pub active_relays_fn: Option<RelayListFn>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/info/p2p", get(info_p2p))
        .route("/relays/found", post(relays_found))
        .route("/status", get(status))
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RelayFoundRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub peer_id: String,
    pub uptime_secs: u64,
    pub active_relays: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn info_p2p(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(InfoResponse {
        info: state.addresses.p2p_info(),
    })
}

async fn relays_found(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RelayFoundRequest>,
) -> impl IntoResponse {
    let key = req.key.trim();
    if key.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing key").into_response();
    }
    let Some(tx) = &state.relays_found else {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay discovery disabled").into_response();
    };
    if tx.send(key.to_string()).await.is_err() {
        tracing::warn!("api: relay pipeline closed");
        return (StatusCode::SERVICE_UNAVAILABLE, "relay pipeline closed").into_response();
    }
    tracing::debug!(%key, "api: relay candidate reported");
    StatusCode::ACCEPTED.into_response()
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active_relays = match &state.active_relays_fn {
        Some(f) => f().await,
        None => vec![],
    };
    Json(StatusResponse {
        peer_id: state.peer_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_relays,
    })
}
