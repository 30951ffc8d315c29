//! Request protocol end to end over real UDP sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tessera_node::handlers;
use tessera_node::request_protocol::{RequestError, RequestEvent};
use tessera_node::transport::TransportKind;

use crate::harness::{FnHandler, TestNode, TestNodeBuilder};

#[tokio::test]
async fn test_ping_pong_response_then_finished() {
    let a = TestNode::start().await.unwrap();
    let b = TestNodeBuilder::new()
        .handler(FnHandler::new(|req, responder| {
            if req.body == json!({ "op": "ping" }) {
                tokio::spawn(async move {
                    responder.send_response(json!({ "pong": true })).await.unwrap();
                    responder.report_finished().await;
                });
            }
        }))
        .start()
        .await
        .unwrap();
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let started = Instant::now();
    let mut handle = a
        .node
        .requests()
        .make_request(b.node_id(), json!({ "op": "ping" }), Some(Duration::from_millis(1000)))
        .await
        .unwrap();
    assert_eq!(handle.next().await, Some(RequestEvent::Response(json!({ "pong": true }))));
    assert_eq!(handle.next().await, Some(RequestEvent::Finished));
    assert!(started.elapsed() < Duration::from_millis(1000));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_timeout_when_handler_never_finishes() {
    let a = TestNode::start().await.unwrap();
    let b = TestNodeBuilder::new()
        .handler(FnHandler::new(|_, _| {}))
        .start()
        .await
        .unwrap();
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let started = Instant::now();
    let err = a
        .node
        .requests()
        .make_request(b.node_id(), json!({ "op": "ping" }), Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err, RequestError::Timeout);
    assert_eq!(err.to_string(), "Timeout while waiting for response.");
    assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "fired late: {elapsed:?}");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_cancel_invokes_responder_callback() {
    let canceled = Arc::new(AtomicBool::new(false));
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let flag = canceled.clone();
    let a = TestNode::start().await.unwrap();
    let b = TestNodeBuilder::new()
        .handler(FnHandler::new(move |_, responder| {
            let flag = flag.clone();
            responder.on_canceled(move || flag.store(true, Ordering::SeqCst));
            let _ = seen_tx.send(());
        }))
        .start()
        .await
        .unwrap();
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let mut handle = a
        .node
        .requests()
        .make_request(b.node_id(), json!({}), None)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    handle.cancel().await;
    assert_eq!(handle.next().await, Some(RequestEvent::Error(RequestError::Canceled)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !canceled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cancellation callback never ran");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_requests_flow_both_directions() {
    let a = TestNode::start().await.unwrap();
    let b = TestNode::start().await.unwrap();
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let timeout = Duration::from_secs(5);
    assert!(handlers::check_alive(a.node.requests(), b.node_id(), timeout).await.unwrap());
    // B answers over the session A opened
    assert!(handlers::check_alive(b.node.requests(), a.node_id(), timeout).await.unwrap());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_remote_error_surfaces_verbatim() {
    let a = TestNode::start().await.unwrap();
    let b = TestNode::start().await.unwrap();
    a.connect_to(&b, TransportKind::Udp).await.unwrap();

    let err = a
        .node
        .requests()
        .make_request(b.node_id(), json!({ "requestType": "checkForFile" }), Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    match err {
        RequestError::Remote(msg) => assert!(msg.starts_with("Invalid request"), "{msg}"),
        other => panic!("expected remote error, got {other:?}"),
    }

    a.shutdown().await;
    b.shutdown().await;
}
