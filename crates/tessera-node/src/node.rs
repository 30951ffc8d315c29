//! A running node: transports, peer links and the request protocol wired
//! together under one shutdown channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tessera_api::{AppState, NodeStatus, PeerDetail};
use tessera_crypto::NodeIdentity;
use tessera_storage::FileStore;

use crate::config::NodeConfig;
use crate::congestion::CongestionParams;
use crate::handlers::RequestHandlers;
use crate::peer_link::{Dialer, LinkStatus, RemoteInfo};
use crate::peer_manager::{self, PeerManager};
use crate::request_protocol::{self, RequestHandler, RequestProtocol};
use crate::session::{self, Session};
use crate::transport::{TransportError, TransportKind};
use crate::udp_server::{self, UdpServer};
use crate::websocket;

/// Dials over our own UDP socket or a fresh WebSocket, then authenticates.
struct NodeDialer {
    udp: Arc<UdpServer>,
    identity: Arc<NodeIdentity>,
    handshake_timeout: Duration,
}

impl Dialer for NodeDialer {
    fn dial(&self, kind: TransportKind, info: &RemoteInfo, node_id: &str) -> BoxFuture<'static, Result<Session, TransportError>> {
        let udp = self.udp.clone();
        let identity = self.identity.clone();
        let timeout = self.handshake_timeout;
        let info = info.clone();
        let node_id = node_id.to_string();
        Box::pin(async move {
            let raw = match kind {
                TransportKind::Udp => {
                    let addr = info.udp_addr.ok_or(TransportError::NoConnection)?;
                    udp.connect(addr).await?
                }
                TransportKind::WebSocket => {
                    let url = info.websocket_url.ok_or(TransportError::NoConnection)?;
                    websocket::connect(&url).await?
                }
            };
            session::initiate(raw, identity, Some(&node_id), timeout).await
        })
    }
}

impl From<LinkStatus> for PeerDetail {
    fn from(s: LinkStatus) -> Self {
        Self {
            node_id: s.node_id,
            incoming_udp: s.incoming_udp,
            outgoing_udp: s.outgoing_udp,
            incoming_websocket: s.incoming_websocket,
            outgoing_websocket: s.outgoing_websocket,
            unconfirmed_messages: s.unconfirmed_messages,
            udp_addr: s.udp_addr,
            websocket_url: s.websocket_url,
        }
    }
}

pub struct Node {
    identity: Arc<NodeIdentity>,
    udp: Arc<UdpServer>,
    websocket_addr: Option<SocketAddr>,
    peers: PeerManager,
    requests: RequestProtocol,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the transports and spawn every background loop, serving
    /// requests from `store`.
    pub async fn start(cfg: &NodeConfig, identity: Arc<NodeIdentity>, store: Arc<dyn FileStore>) -> anyhow::Result<Self> {
        let handlers = Arc::new(RequestHandlers::new(store, cfg.requests.clone()));
        Self::start_with_handler(cfg, identity, handlers).await
    }

    pub async fn start_with_handler(
        cfg: &NodeConfig,
        identity: Arc<NodeIdentity>,
        handler: Arc<dyn RequestHandler>,
    ) -> anyhow::Result<Self> {
        let params = cfg.transport.params();
        let congestion = CongestionParams::from_transport(&params);
        let udp_addr: SocketAddr = cfg.network.udp_listen_addr.parse()?;
        let public_override = match &cfg.network.public_udp_addr {
            Some(a) => Some(a.parse::<SocketAddr>()?),
            None => None,
        };

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let (udp, receiver) = UdpServer::bind(udp_addr, params, congestion, public_override).await?;
        tasks.push(tokio::spawn(udp_server::run_udp_loop(
            udp.clone(),
            receiver,
            incoming_tx.clone(),
            shutdown_tx.subscribe(),
        )));

        let websocket_addr = match &cfg.network.websocket_listen_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                tasks.push(tokio::spawn(websocket::run_websocket_loop(
                    listener,
                    incoming_tx.clone(),
                    shutdown_tx.subscribe(),
                )));
                Some(local)
            }
            None => None,
        };
        drop(incoming_tx);

        let dialer = Arc::new(NodeDialer {
            udp: udp.clone(),
            identity: identity.clone(),
            handshake_timeout: Duration::from_millis(params.session_handshake_timeout_ms),
        });
        let (peers, inbound_rx) =
            PeerManager::new(identity.node_id().to_string(), params, cfg.network.udp_first, dialer);

        let requests = RequestProtocol::new(peers.clone(), handler);

        tasks.push(tokio::spawn(peer_manager::run_accept_loop(
            peers.clone(),
            identity.clone(),
            incoming_rx,
            shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(peer_manager::run_expiry_loop(
            peers.clone(),
            shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(request_protocol::run_request_loop(
            requests.clone(),
            inbound_rx,
            peers.subscribe(),
            shutdown_tx.subscribe(),
        )));

        for entry in &cfg.network.peers {
            let info = entry.remote_info()?;
            peers.add_static_peer(&entry.node_id, info).await;
        }

        tracing::info!(
            node_id = %identity.node_id(),
            udp = %udp.local_addr(),
            websocket = ?websocket_addr,
            static_peers = cfg.network.peers.len(),
            "node: started"
        );

        Ok(Self {
            identity,
            udp,
            websocket_addr,
            peers,
            requests,
            shutdown_tx,
            tasks,
        })
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.websocket_addr
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn requests(&self) -> &RequestProtocol {
        &self.requests
    }

    /// Receiver that fires when the node shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn status(&self) -> NodeStatus {
        collect_status(&self.udp, self.websocket_addr, &self.peers, &self.requests).await
    }

    /// API state backed by this node's live status.
    pub fn api_state(&self, bearer_token: String) -> AppState {
        let (udp, ws, peers, requests) = (
            self.udp.clone(),
            self.websocket_addr,
            self.peers.clone(),
            self.requests.clone(),
        );
        let list_peers = self.peers.clone();
        AppState {
            node_id: self.identity.node_id().to_string(),
            bearer_token,
            start_time: std::time::Instant::now(),
            status_fn: Some(Box::new(move || {
                let (udp, peers, requests) = (udp.clone(), peers.clone(), requests.clone());
                Box::pin(async move { collect_status(&udp, ws, &peers, &requests).await })
            })),
            peer_list_fn: Some(Box::new(move || {
                let peers = list_peers.clone();
                Box::pin(async move { peers.peer_status().await.into_iter().map(PeerDetail::from).collect() })
            })),
        }
    }

    /// Stop every loop and halt all peer links.
    pub async fn shutdown(self) {
        tracing::info!(node_id = %self.identity.node_id(), "node: shutting down");
        let _ = self.shutdown_tx.send(());
        self.peers.halt_all().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn collect_status(
    udp: &UdpServer,
    websocket_addr: Option<SocketAddr>,
    peers: &PeerManager,
    requests: &RequestProtocol,
) -> NodeStatus {
    NodeStatus {
        public_udp_endpoint: udp.public_endpoint().await.map(|a| a.to_string()),
        udp_listen_addr: Some(udp.local_addr().to_string()),
        websocket_listen_addr: websocket_addr.map(|a| a.to_string()),
        known_peers: peers.len().await,
        connected_peers: peers.connected_count().await,
        pending_requests: requests.pending_count(),
        active_requests: requests.active_count(),
    }
}
