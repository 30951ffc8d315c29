//! Tessera API -- local node status API.
//!
//! HTTP on 127.0.0.1:9483 by default.
//! Bearer token auth from ~/.tessera/node-token.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Live transport figures supplied by the node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    /// Our UDP endpoint as observed by peers, once learned.
    pub public_udp_endpoint: Option<String>,
    pub udp_listen_addr: Option<String>,
    pub websocket_listen_addr: Option<String>,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub pending_requests: usize,
    pub active_requests: usize,
}

/// Callback to get the node's transport status.
pub type NodeStatusFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = NodeStatus> + Send>> + Send + Sync>;

/// Per-peer connectivity for API response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerDetail {
    pub node_id: String,
    pub incoming_udp: bool,
    pub outgoing_udp: bool,
    pub incoming_websocket: bool,
    pub outgoing_websocket: bool,
    pub unconfirmed_messages: usize,
    pub udp_addr: Option<String>,
    pub websocket_url: Option<String>,
}

impl PeerDetail {
    pub fn is_connected(&self) -> bool {
        self.incoming_udp || self.outgoing_udp || self.incoming_websocket || self.outgoing_websocket
    }
}

/// Callback to get the peer list from the node's peer manager.
pub type PeerListFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = Vec<PeerDetail>> + Send>> + Send + Sync>;

/// Shared state for all API handlers.
pub struct AppState {
    pub node_id: String,
    pub bearer_token: String,
    pub start_time: std::time::Instant,
    pub status_fn: Option<NodeStatusFn>,
    pub peer_list_fn: Option<PeerListFn>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", post(status))
        .route("/api/v1/peers", post(peers))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        tracing::debug!("api: rejected request with bad bearer token");
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub status: NodeStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub connected: usize,
    pub total: usize,
    pub peers: Vec<PeerDetail>,
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let status = if let Some(f) = &state.status_fn {
        f().await
    } else {
        NodeStatus::default()
    };

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        status,
    })
    .into_response()
}

async fn peers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let peers = if let Some(f) = &state.peer_list_fn {
        f().await
    } else {
        vec![]
    };

    Json(PeersResponse {
        connected: peers.iter().filter(|p| p.is_connected()).count(),
        total: peers.len(),
        peers,
    })
    .into_response()
}
