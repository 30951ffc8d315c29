//! File transfer over each transport, and the connectivity the status API
//! reports while it runs.

use std::time::Duration;

use tessera_node::config::RequestsSection;
use tessera_node::handlers::{check_for_file, download_file};
use tessera_node::transport::{Direction, TransportKind};

use crate::harness::{TestNode, TestNodeBuilder};

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_download_over_udp() {
    let a = TestNode::start().await.unwrap();
    let b = TestNode::start().await.unwrap();
    let data = content(300_000);
    let key = b.store_file(&data);
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let found = check_for_file(a.node.requests(), b.node_id(), key.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(found.found);
    assert_eq!(found.size, Some(300_000));

    let got = download_file(a.node.requests(), b.node_id(), key.clone(), 0, 300_000, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(got.len(), data.len());
    assert!(got == data, "downloaded bytes differ");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_download_over_websocket() {
    let a = TestNode::start().await.unwrap();
    let b = TestNodeBuilder::new()
        .websocket()
        .requests(RequestsSection {
            download_chunk_bytes: 4096,
            max_unacknowledged_responses: 8,
            ..RequestsSection::default()
        })
        .start()
        .await
        .unwrap();
    let data = content(100_000);
    let key = b.store_file(&data);
    a.connect_to(&b, TransportKind::WebSocket).await.unwrap();

    let link = a.node.peers().link(b.node_id()).await.unwrap();
    assert!(link.is_connected(Direction::Outgoing, TransportKind::WebSocket));
    assert!(!link.is_connected(Direction::Outgoing, TransportKind::Udp));

    let got = download_file(a.node.requests(), b.node_id(), key, 10_000, 90_000, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(got == data[10_000..90_000], "downloaded bytes differ");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_status_api_reports_connectivity() {
    let a = TestNode::start().await.unwrap();
    let b = TestNode::start().await.unwrap();
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let status = a.api_post("/api/v1/status").await.unwrap();
    assert_eq!(status["node_id"], a.node_id());
    assert_eq!(status["connected_peers"], 1);
    // Loopback observations never become a public endpoint
    assert!(status["public_udp_endpoint"].is_null());

    let peers = b.api_post("/api/v1/peers").await.unwrap();
    assert_eq!(peers["connected"], 1);
    assert_eq!(peers["peers"][0]["node_id"], a.node_id());
    assert_eq!(peers["peers"][0]["incoming_udp"], true);
    assert_eq!(peers["peers"][0]["outgoing_udp"], false);

    a.shutdown().await;
    b.shutdown().await;
}
