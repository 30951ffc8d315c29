//! UDP server -- one socket multiplexing every reliable connection by id.
//!
//! The receive loop reassembles envelopes, answers `openConnection`, routes
//! `acceptConnection` and connection traffic to the owning connection task,
//! and learns our public endpoint from what acceptors report.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;

use tessera_protocol::{
    is_valid_connection_id, random_id, ConnectionEnvelope, HandshakeMessage, PublicEndpoint, TransportParams,
    UdpEnvelope, ID_LEN,
};

use crate::congestion::CongestionParams;
use crate::external_addr::ExternalAddr;
use crate::transport::{connection_pair, Direction, RawConnection, TransportError, TransportKind};
use crate::udp_connection::{ConnectionInput, ConnectionTask, ReliableState, Route, Routes};
use crate::udp_link::{self, FramedReceiver, FramedUdpLink};

pub struct UdpServer {
    link: FramedUdpLink,
    routes: Routes,
    params: TransportParams,
    congestion: CongestionParams,
    external: RwLock<ExternalAddr>,
    local_addr: SocketAddr,
}

impl UdpServer {
    /// Bind the shared socket. The receiver half must be handed to
    /// `run_udp_loop`.
    pub async fn bind(
        addr: SocketAddr,
        params: TransportParams,
        congestion: CongestionParams,
        public_override: Option<SocketAddr>,
    ) -> std::io::Result<(Arc<Self>, FramedReceiver)> {
        let (link, receiver) = udp_link::bind(addr).await?;
        let local_addr = link.local_addr()?;
        let server = Arc::new(Self {
            link,
            routes: Arc::new(RwLock::new(HashMap::new())),
            params,
            congestion,
            external: RwLock::new(ExternalAddr::new(public_override)),
            local_addr,
        });
        Ok((server, receiver))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our public endpoint, once learned (or configured).
    pub async fn public_endpoint(&self) -> Option<SocketAddr> {
        self.external.read().await.get()
    }

    pub async fn connection_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Open an outgoing connection. Resolves once the remote accepts, or
    /// fails after the connect timeout.
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<RawConnection, TransportError> {
        let (opened_tx, opened_rx) = oneshot::channel();
        let raw = {
            let mut routes = self.routes.write().await;
            let mut id = random_id(ID_LEN);
            while routes.contains_key(&id) {
                id = random_id(ID_LEN);
            }
            let state = ReliableState::outgoing(id.clone(), self.params, self.congestion, Instant::now());
            self.spawn_connection(&mut routes, state, remote, Direction::Outgoing, Some(opened_tx))
        };
        tracing::debug!(connection = %raw.handle.id(), %remote, "udp: opening connection");

        match opened_rx.await {
            Ok(Ok(())) => Ok(raw),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn spawn_connection(
        &self,
        routes: &mut HashMap<String, Route>,
        state: ReliableState,
        remote: SocketAddr,
        direction: Direction,
        opened: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) -> RawConnection {
        let id = state.id().to_string();
        let (raw, ends) = connection_pair(id.clone(), TransportKind::Udp, direction, remote.to_string());
        let (tx, input) = mpsc::unbounded_channel();
        routes.insert(id, Route { remote, tx });
        let task = ConnectionTask {
            state,
            remote,
            link: self.link.clone(),
            ends,
            input,
            routes: self.routes.clone(),
            opened,
        };
        tokio::spawn(task.run());
        raw
    }

    async fn handle_envelope(&self, from: SocketAddr, envelope: UdpEnvelope, incoming: &mpsc::UnboundedSender<RawConnection>) {
        match envelope {
            UdpEnvelope::Handshake(HandshakeMessage::OpenConnection { connection_id }) => {
                self.handle_open(from, connection_id, incoming).await;
            }
            UdpEnvelope::Handshake(HandshakeMessage::AcceptConnection {
                connection_id,
                initiator_public_endpoint,
            }) => {
                let route = self.routes.read().await.get(&connection_id).cloned();
                match route {
                    Some(route) if route.remote == from => {
                        let _ = route.tx.send(ConnectionInput::Accepted);
                        self.external.write().await.observe(&initiator_public_endpoint);
                    }
                    _ => tracing::debug!(%from, connection = %connection_id, "udp: stray acceptConnection dropped"),
                }
            }
            UdpEnvelope::Connection(ConnectionEnvelope { connection_id, message }) => {
                let route = self.routes.read().await.get(&connection_id).cloned();
                match route {
                    Some(route) if route.remote == from => {
                        let _ = route.tx.send(ConnectionInput::Message(message));
                    }
                    Some(_) => {
                        tracing::debug!(%from, connection = %connection_id, "udp: message from wrong remote dropped")
                    }
                    None => tracing::trace!(%from, connection = %connection_id, "udp: message for unknown connection"),
                }
            }
        }
    }

    async fn handle_open(&self, from: SocketAddr, connection_id: String, incoming: &mpsc::UnboundedSender<RawConnection>) {
        if !is_valid_connection_id(&connection_id) {
            tracing::debug!(%from, "udp: openConnection with invalid id ignored");
            return;
        }
        let accept = UdpEnvelope::Handshake(HandshakeMessage::AcceptConnection {
            connection_id: connection_id.clone(),
            initiator_public_endpoint: PublicEndpoint {
                address: from.ip().to_string(),
                port: from.port(),
            },
        });

        let raw = {
            let mut routes = self.routes.write().await;
            match routes.get(&connection_id) {
                // Our accept was lost and the initiator retried
                Some(route) if route.remote == from => None,
                Some(_) => {
                    tracing::debug!(%from, connection = %connection_id, "udp: connection id already in use, open ignored");
                    return;
                }
                None => {
                    let state = ReliableState::incoming(connection_id.clone(), self.params, self.congestion, Instant::now());
                    Some(self.spawn_connection(&mut routes, state, from, Direction::Incoming, None))
                }
            }
        };

        self.link.send_envelope(from, &accept).await;
        if let Some(raw) = raw {
            tracing::debug!(%from, connection = %connection_id, "udp: accepted incoming connection");
            if incoming.send(raw).is_err() {
                tracing::debug!("udp: no listener for incoming connections");
            }
        }
    }
}

/// Run the UDP receive loop until shutdown. Accepted connections are sent on
/// `incoming`.
pub async fn run_udp_loop(
    server: Arc<UdpServer>,
    mut receiver: FramedReceiver,
    incoming: mpsc::UnboundedSender<RawConnection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(addr = %server.local_addr, "udp: listening");
    loop {
        tokio::select! {
            received = receiver.recv_envelope() => match received {
                Ok((from, envelope)) => server.handle_envelope(from, envelope, &incoming).await,
                Err(e) => {
                    // ICMP unreachable surfaces as a recv error on some platforms
                    tracing::debug!("udp: recv error: {e}");
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("udp: shutdown signal, stopping receive loop");
                break;
            }
        }
    }
}
