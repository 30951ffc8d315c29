//! Session authentication against a real node.

use std::sync::Arc;
use std::time::Duration;

use tessera_crypto::NodeIdentity;
use tessera_node::congestion::CongestionParams;
use tessera_node::session;
use tessera_node::transport::TransportError;
use tessera_node::udp_server::{run_udp_loop, UdpServer};
use tessera_protocol::codec::encode_frame;
use tessera_protocol::{FrameBody, PeerMessage, SignedFrame, DEFAULT_PARAMS};

use crate::harness::TestNode;

/// A bare UDP endpoint with its own identity, outside any node.
async fn rogue() -> (Arc<UdpServer>, Arc<NodeIdentity>, tokio::sync::broadcast::Sender<()>) {
    let (server, receiver) = UdpServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        DEFAULT_PARAMS,
        CongestionParams::default(),
        None,
    )
    .await
    .unwrap();
    let (incoming, _) = tokio::sync::mpsc::unbounded_channel();
    let (stop, shutdown) = tokio::sync::broadcast::channel(1);
    tokio::spawn(run_udp_loop(server.clone(), receiver, incoming, shutdown));
    (server, Arc::new(NodeIdentity::generate().unwrap()), stop)
}

#[tokio::test]
async fn test_bad_signature_closes_connection() {
    let node = TestNode::start().await.unwrap();
    let (udp, identity, _stop) = rogue().await;

    let raw = udp.connect(node.node.udp_addr()).await.unwrap();
    let session = session::initiate(raw, identity.clone(), Some(node.node_id()), Duration::from_secs(5))
        .await
        .unwrap();
    node.wait_connected(identity.node_id(), Duration::from_secs(5))
        .await
        .unwrap();

    let body = FrameBody {
        from_node_id: identity.node_id().to_string(),
        message: serde_json::to_value(PeerMessage::Confirm {
            confirm_id: "x".into(),
        })
        .unwrap(),
    };
    let forged = SignedFrame {
        body,
        signature: "00".repeat(64),
    };
    let handle = session.sender.handle().clone();
    handle.send(encode_frame(&forged).unwrap()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle.closed())
        .await
        .expect("node kept a connection that sent a forged frame");
    assert!(!handle.is_open());

    node.shutdown().await;
}

#[tokio::test]
async fn test_dial_rejects_unexpected_node_id() {
    let node = TestNode::start().await.unwrap();
    let (udp, identity, _stop) = rogue().await;

    let raw = udp.connect(node.node.udp_addr()).await.unwrap();
    let someone_else = "ab".repeat(32);
    let err = session::initiate(raw, identity, Some(&someone_else), Duration::from_secs(5))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Handshake(_)), "{err}");

    node.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_is_not_connected() {
    let a = TestNode::start().await.unwrap();
    let (udp, _identity, stop) = rogue().await;
    let addr = udp.local_addr();
    // Nothing answers openConnection once the endpoint is gone
    drop(stop);
    drop(udp);

    let info = tessera_node::peer_link::RemoteInfo {
        udp_addr: Some(addr),
        websocket_url: None,
    };
    a.node.peers().add_static_peer(&"cd".repeat(32), info).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!a.node.peers().has_connection(&"cd".repeat(32)).await);
    let status = a.api_post("/api/v1/peers").await.unwrap();
    assert_eq!(status["connected"], 0);
    assert_eq!(status["total"], 1);

    a.shutdown().await;
}
