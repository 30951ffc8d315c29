//! Peer manager -- registry of PeerLinks keyed by remote node id.
//!
//! Links are created lazily: on the first inbound session from a node, or
//! when its addresses become known. Non-static links whose remote info has
//! gone stale, and which hold no session, are expired.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;

use tessera_crypto::NodeIdentity;
use tessera_protocol::{NodeId, NodeToNodeMessage, TransportParams};

use crate::peer_link::{Dialer, InboundMessage, LinkStatus, PeerEvent, PeerLink, RemoteInfo};
use crate::session::{self, Session};
use crate::transport::{Direction, RawConnection, TransportError};

/// Thread-safe registry of peer links.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<RwLock<HashMap<NodeId, Arc<PeerLink>>>>,
    static_peers: Arc<RwLock<HashSet<NodeId>>>,
    local_node_id: NodeId,
    params: TransportParams,
    udp_first: bool,
    dialer: Arc<dyn Dialer>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerManager {
    /// Returns the manager and the stream of deduplicated inbound messages
    /// from every peer.
    pub fn new(
        local_node_id: NodeId,
        params: TransportParams,
        udp_first: bool,
        dialer: Arc<dyn Dialer>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let manager = Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            static_peers: Arc::new(RwLock::new(HashSet::new())),
            local_node_id,
            params,
            udp_first,
            dialer,
            inbound,
            events,
        };
        (manager, inbound_rx)
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Get the link for `node_id`, creating and starting it if needed.
    pub async fn get_or_create(&self, node_id: &str) -> Arc<PeerLink> {
        if let Some(link) = self.inner.read().await.get(node_id) {
            return link.clone();
        }
        let mut links = self.inner.write().await;
        if let Some(link) = links.get(node_id) {
            return link.clone();
        }
        let link = PeerLink::new(
            node_id.to_string(),
            self.params,
            self.udp_first,
            self.dialer.clone(),
            self.inbound.clone(),
            self.events.clone(),
        );
        link.start();
        links.insert(node_id.to_string(), link.clone());
        tracing::debug!(peer = %node_id, peers = links.len(), "peers: link created");
        link
    }

    pub async fn link(&self, node_id: &str) -> Option<Arc<PeerLink>> {
        self.inner.read().await.get(node_id).cloned()
    }

    /// Refresh where `node_id` can be reached.
    pub async fn set_remote_info(&self, node_id: &str, info: RemoteInfo) {
        if node_id == self.local_node_id {
            return;
        }
        self.get_or_create(node_id).await.set_remote_addresses(info);
    }

    /// A configured peer: never expires.
    pub async fn add_static_peer(&self, node_id: &str, info: RemoteInfo) {
        if node_id == self.local_node_id {
            tracing::warn!("peers: ignoring static peer entry for our own node id");
            return;
        }
        self.static_peers.write().await.insert(node_id.to_string());
        self.set_remote_info(node_id, info).await;
    }

    /// Install an authenticated inbound session.
    pub async fn accept_session(&self, session: Session) {
        let node_id = session.remote_node_id.clone();
        self.get_or_create(&node_id)
            .await
            .set_connection(Direction::Incoming, session);
    }

    pub async fn send(&self, node_id: &str, message: NodeToNodeMessage) -> Result<(), TransportError> {
        match self.link(node_id).await {
            Some(link) => link.send(message),
            None => Err(TransportError::NoConnection),
        }
    }

    pub async fn is_peer(&self, node_id: &str) -> bool {
        self.inner.read().await.contains_key(node_id)
    }

    pub async fn has_connection(&self, node_id: &str) -> bool {
        self.link(node_id).await.is_some_and(|l| l.has_connection())
    }

    pub async fn peer_status(&self) -> Vec<LinkStatus> {
        let mut status: Vec<LinkStatus> = self.inner.read().await.values().map(|l| l.status()).collect();
        status.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        status
    }

    pub async fn connected_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|l| l.has_connection())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove links with stale remote info and no session. Returns the
    /// expired node ids.
    pub async fn expire_stale(&self, now: Instant) -> Vec<NodeId> {
        let expiry = Duration::from_millis(self.params.peer_expiry_ms);
        let static_peers = self.static_peers.read().await;
        let mut links = self.inner.write().await;
        let stale: Vec<NodeId> = links
            .iter()
            .filter(|(id, link)| {
                !static_peers.contains(*id)
                    && !link.has_connection()
                    && now.saturating_duration_since(link.remote_updated()) >= expiry
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(link) = links.remove(id) {
                link.halt();
            }
            tracing::info!(peer = %id, "peers: link expired");
            let _ = self.events.send(PeerEvent::Unreachable { node_id: id.clone() });
        }
        stale
    }

    /// Halt every link. Used on shutdown.
    pub async fn halt_all(&self) {
        for link in self.inner.write().await.drain().map(|(_, l)| l) {
            link.halt();
        }
    }
}

/// Periodically expire stale links until shutdown.
pub async fn run_expiry_loop(manager: PeerManager, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_millis(manager.params.peer_expiry_check_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                manager.expire_stale(Instant::now()).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("peers: shutdown signal, stopping expiry loop");
                break;
            }
        }
    }
}

/// Run the acceptor side of the identity handshake for every incoming raw
/// connection (both transports) and hand the sessions to the manager.
pub async fn run_accept_loop(
    manager: PeerManager,
    identity: Arc<NodeIdentity>,
    mut incoming: mpsc::UnboundedReceiver<RawConnection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let timeout = Duration::from_millis(manager.params.session_handshake_timeout_ms);
    loop {
        tokio::select! {
            raw = incoming.recv() => {
                let Some(raw) = raw else { break };
                let manager = manager.clone();
                let identity = identity.clone();
                tokio::spawn(async move {
                    let kind = raw.handle.kind();
                    let remote = raw.handle.remote().to_string();
                    match session::accept(raw, identity, timeout).await {
                        Ok(session) => manager.accept_session(session).await,
                        Err(e) => tracing::debug!(%kind, %remote, "peers: inbound handshake failed: {e}"),
                    }
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("peers: shutdown signal, stopping accept loop");
                break;
            }
        }
    }
}
