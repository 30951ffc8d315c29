//! In-process nodes joined by loopback sessions, for unit tests.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};

use tessera_crypto::NodeIdentity;
use tessera_protocol::{NodeToNodeMessage, DEFAULT_PARAMS};

use crate::peer_link::{Dialer, RemoteInfo};
use crate::peer_manager::PeerManager;
use crate::request_protocol::{run_request_loop, RequestHandler, RequestProtocol};
use crate::session::{self, Session};
use crate::transport::{loopback_pair, Direction, TransportError, TransportKind};

/// Never reaches anyone.
pub(crate) struct NoDialer;

impl Dialer for NoDialer {
    fn dial(&self, _: TransportKind, _: &RemoteInfo, _: &str) -> BoxFuture<'static, Result<Session, TransportError>> {
        Box::pin(async { Err(TransportError::NoConnection) })
    }
}

pub(crate) struct TestNode {
    pub id: Arc<NodeIdentity>,
    pub peers: PeerManager,
    pub protocol: RequestProtocol,
    _stop: broadcast::Sender<()>,
}

pub(crate) fn spawn_node(handler: Arc<dyn RequestHandler>) -> TestNode {
    spawn_filtered(handler, |_| true)
}

/// Like `spawn_node`, but inbound messages for which `keep` is false never
/// reach the request protocol.
pub(crate) fn spawn_filtered(handler: Arc<dyn RequestHandler>, keep: fn(&NodeToNodeMessage) -> bool) -> TestNode {
    let id = Arc::new(NodeIdentity::generate().unwrap());
    let (peers, mut inbound) = PeerManager::new(id.node_id().to_string(), DEFAULT_PARAMS, false, Arc::new(NoDialer));
    let protocol = RequestProtocol::new(peers.clone(), handler);
    let (stop, shutdown) = broadcast::channel(1);
    let (filtered_tx, filtered) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if keep(&message.message) {
                let _ = filtered_tx.send(message);
            }
        }
    });
    tokio::spawn(run_request_loop(protocol.clone(), filtered, peers.subscribe(), shutdown));
    TestNode {
        id,
        peers,
        protocol,
        _stop: stop,
    }
}

/// Give `a` an outgoing session to `b` (and `b` the incoming end).
pub(crate) async fn link(a: &TestNode, b: &TestNode) {
    let (ra, rb) = loopback_pair(TransportKind::Udp);
    let timeout = Duration::from_secs(5);
    let (sa, sb) = tokio::join!(
        session::initiate(ra, a.id.clone(), Some(b.id.node_id()), timeout),
        session::accept(rb, b.id.clone(), timeout)
    );
    a.peers
        .get_or_create(b.id.node_id())
        .await
        .set_connection(Direction::Outgoing, sa.unwrap());
    b.peers.accept_session(sb.unwrap()).await;
}
