//! Node-to-node requests multiplexed over peer links.
//!
//! One request produces zero or more ordered responses and then exactly one
//! terminal outcome: finished, error, timeout, cancellation or loss of the
//! peer. Responses may arrive out of order; they are acknowledged on
//! arrival, buffered by index and released strictly in order. The
//! acknowledgments double as the responder's backpressure signal.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use tessera_protocol::{random_id, NodeId, NodeToNodeMessage, ID_LEN};

use crate::peer_link::{InboundMessage, PeerEvent};
use crate::peer_manager::PeerManager;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Timeout while waiting for response.")]
    Timeout,
    /// Reported by the remote handler; shown verbatim.
    #[error("{0}")]
    Remote(String),
    #[error("Request canceled.")]
    Canceled,
    #[error("Connection to node {0} lost.")]
    ConnectionLost(NodeId),
    #[error("Unable to send: {0}")]
    Send(String),
    #[error("Request already completed.")]
    Completed,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Response(Value),
    Finished,
    Error(RequestError),
}

// ============================================================================
// Client side
// ============================================================================

/// Reorders responses by index and tracks completion.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    buffered: BTreeMap<u64, Value>,
    next_expected: u64,
    num_responses: Option<u64>,
}

impl ResponseBuffer {
    /// Accept one response; returns whatever is now deliverable in order.
    /// Duplicates and already-delivered indices are dropped.
    pub fn push(&mut self, index: u64, body: Value) -> Vec<Value> {
        if index >= self.next_expected {
            self.buffered.entry(index).or_insert(body);
        }
        let mut ready = Vec::new();
        while let Some(body) = self.buffered.remove(&self.next_expected) {
            ready.push(body);
            self.next_expected += 1;
        }
        ready
    }

    pub fn set_total(&mut self, num_responses: u64) {
        self.num_responses = Some(num_responses);
    }

    /// True once the finish count is known and every response has been
    /// released.
    pub fn is_complete(&self) -> bool {
        self.num_responses == Some(self.next_expected)
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }
}

struct PendingRequest {
    to: NodeId,
    responses: ResponseBuffer,
    last_activity: Instant,
    events: mpsc::UnboundedSender<RequestEvent>,
}

/// Caller's view of one outstanding request.
pub struct RequestHandle {
    request_id: String,
    to: NodeId,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    protocol: RequestProtocol,
}

impl RequestHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next event. After a terminal event this returns `None`.
    pub async fn next(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Ask the responder to stop. Locally the request ends with
    /// `RequestError::Canceled`.
    pub async fn cancel(&self) {
        if let Some(pending) = self.protocol.remove_pending(&self.request_id) {
            let _ = pending.events.send(RequestEvent::Error(RequestError::Canceled));
            let cancel = NodeToNodeMessage::CancelRequestToNode {
                request_id: self.request_id.clone(),
            };
            if let Err(e) = self.protocol.inner.peers.send(&self.to, cancel).await {
                tracing::debug!(peer = %self.to, request = %self.request_id, "rpc: cancel not sent: {e}");
            }
        }
    }

    /// Drain the request: every response in order, or the terminal error.
    pub async fn collect(mut self) -> Result<Vec<Value>, RequestError> {
        let mut responses = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                RequestEvent::Response(body) => responses.push(body),
                RequestEvent::Finished => return Ok(responses),
                RequestEvent::Error(e) => return Err(e),
            }
        }
        Err(RequestError::Canceled)
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.protocol.remove_pending(&self.request_id);
    }
}

// ============================================================================
// Server side
// ============================================================================

/// A request received from a peer.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub from: NodeId,
    pub request_id: String,
    pub body: Value,
}

/// Application-level request dispatcher.
pub trait RequestHandler: Send + Sync {
    /// Called once per request. Must not block; long work belongs in a task
    /// that keeps the `Responder`.
    fn on_request(&self, request: IncomingRequest, responder: Responder);
}

type CanceledCallback = Box<dyn FnOnce() + Send>;
type ReceivedCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct ActiveState {
    num_sent: u64,
    num_acknowledged: u64,
    completed: bool,
    on_canceled: Vec<CanceledCallback>,
    on_received: Vec<ReceivedCallback>,
}

struct ActiveIncoming {
    from: NodeId,
    request_id: String,
    state: Mutex<ActiveState>,
    canceled: watch::Sender<bool>,
    /// Bumped on every acknowledgment.
    progress: watch::Sender<u64>,
}

impl ActiveIncoming {
    fn state(&self) -> MutexGuard<'_, ActiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        if self.canceled.send_replace(true) {
            return;
        }
        let callbacks = std::mem::take(&mut self.state().on_canceled);
        for cb in callbacks {
            cb();
        }
    }

    fn acknowledged(&self, index: u64) {
        let callbacks = {
            let mut st = self.state();
            st.num_acknowledged += 1;
            st.on_received.clone()
        };
        for cb in &callbacks {
            cb(index);
        }
        self.progress.send_modify(|n| *n += 1);
    }
}

/// The responder's handle on one incoming request.
#[derive(Clone)]
pub struct Responder {
    protocol: RequestProtocol,
    active: Arc<ActiveIncoming>,
}

impl Responder {
    pub fn requester(&self) -> &str {
        &self.active.from
    }

    pub fn request_id(&self) -> &str {
        &self.active.request_id
    }

    /// Send the next response. Returns its index.
    pub async fn send_response(&self, body: Value) -> Result<u64, RequestError> {
        let index = {
            let mut st = self.active.state();
            if st.completed {
                return Err(RequestError::Completed);
            }
            let index = st.num_sent;
            st.num_sent += 1;
            index
        };
        let message = NodeToNodeMessage::RequestToNodeResponse {
            request_id: self.active.request_id.clone(),
            response_index: index,
            response_body: body,
        };
        self.protocol
            .inner
            .peers
            .send(&self.active.from, message)
            .await
            .map_err(|e| RequestError::Send(e.to_string()))?;
        Ok(index)
    }

    /// End the request with an error. No-op once completed.
    pub async fn report_error(&self, error: impl Into<String>) {
        if !self.complete() {
            return;
        }
        let message = NodeToNodeMessage::RequestToNodeError {
            request_id: self.active.request_id.clone(),
            error_string: error.into(),
        };
        self.send_terminal(message).await;
    }

    /// End the request successfully. No-op once completed.
    pub async fn report_finished(&self) {
        if !self.complete() {
            return;
        }
        let num_responses = self.active.state().num_sent;
        let message = NodeToNodeMessage::RequestToNodeFinished {
            request_id: self.active.request_id.clone(),
            num_responses,
        };
        self.send_terminal(message).await;
    }

    /// Mark completed and drop the bookkeeping. False if already completed.
    fn complete(&self) -> bool {
        {
            let mut st = self.active.state();
            if st.completed {
                return false;
            }
            st.completed = true;
        }
        self.protocol
            .active()
            .remove(&(self.active.from.clone(), self.active.request_id.clone()));
        true
    }

    async fn send_terminal(&self, message: NodeToNodeMessage) {
        if let Err(e) = self.protocol.inner.peers.send(&self.active.from, message).await {
            tracing::debug!(peer = %self.active.from, request = %self.active.request_id, "rpc: terminal message not sent: {e}");
        }
    }

    /// Run `cb` when the requester cancels (at once if it already has).
    pub fn on_canceled(&self, cb: impl FnOnce() + Send + 'static) {
        if self.is_canceled() {
            cb();
            return;
        }
        self.active.state().on_canceled.push(Box::new(cb));
        // Canceled between the check and the push
        if self.is_canceled() {
            let callbacks = std::mem::take(&mut self.active.state().on_canceled);
            for cb in callbacks {
                cb();
            }
        }
    }

    /// Run `cb(index)` for every response the requester acknowledges.
    pub fn on_response_received(&self, cb: impl Fn(u64) + Send + Sync + 'static) {
        self.active.state().on_received.push(Arc::new(cb));
    }

    pub fn is_canceled(&self) -> bool {
        *self.active.canceled.borrow()
    }

    /// Resolves when the requester cancels.
    pub async fn canceled(&self) {
        let mut rx = self.active.canceled.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn num_unacknowledged(&self) -> u64 {
        let st = self.active.state();
        st.num_sent.saturating_sub(st.num_acknowledged)
    }

    /// Wait until at most `max_outstanding` responses are unacknowledged.
    /// Fails with `Timeout` if no acknowledgment arrives for `timeout`, or
    /// `Canceled` if the requester cancels meanwhile.
    pub async fn wait_for_backlog(&self, max_outstanding: u64, timeout: Duration) -> Result<(), RequestError> {
        let mut progress = self.active.progress.subscribe();
        loop {
            if self.num_unacknowledged() <= max_outstanding {
                return Ok(());
            }
            if self.is_canceled() {
                return Err(RequestError::Canceled);
            }
            tokio::select! {
                changed = tokio::time::timeout(timeout, progress.changed()) => match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Err(RequestError::Canceled),
                    Err(_) => return Err(RequestError::Timeout),
                },
                _ = self.canceled() => return Err(RequestError::Canceled),
            }
        }
    }
}

// ============================================================================
// Protocol
// ============================================================================

struct Inner {
    peers: PeerManager,
    handler: Arc<dyn RequestHandler>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    active: Mutex<HashMap<(NodeId, String), Arc<ActiveIncoming>>>,
}

#[derive(Clone)]
pub struct RequestProtocol {
    inner: Arc<Inner>,
}

impl RequestProtocol {
    pub fn new(peers: PeerManager, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers,
                handler,
                pending: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<(NodeId, String), Arc<ActiveIncoming>>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending().remove(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Send a request to `to`. Without a timeout the request waits for its
    /// terminal message (or the loss of the peer) indefinitely.
    pub async fn make_request(
        &self,
        to: &str,
        body: Value,
        timeout: Option<Duration>,
    ) -> Result<RequestHandle, RequestError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = {
            let mut pending = self.pending();
            let mut id = random_id(ID_LEN);
            while pending.contains_key(&id) {
                id = random_id(ID_LEN);
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    to: to.to_string(),
                    responses: ResponseBuffer::default(),
                    last_activity: Instant::now(),
                    events: tx,
                },
            );
            id
        };
        let handle = RequestHandle {
            request_id: request_id.clone(),
            to: to.to_string(),
            events: rx,
            protocol: self.clone(),
        };

        let message = NodeToNodeMessage::RequestToNode {
            request_id: request_id.clone(),
            request_body: body,
        };
        if let Err(e) = self.inner.peers.send(to, message).await {
            return Err(RequestError::Send(e.to_string()));
        }
        tracing::debug!(peer = %to, request = %request_id, "rpc: request sent");

        if let Some(timeout) = timeout {
            tokio::spawn(self.clone().watch_timeout(request_id, timeout));
        }
        Ok(handle)
    }

    /// Fail the request once it has been idle for `timeout`.
    async fn watch_timeout(self, request_id: String, timeout: Duration) {
        loop {
            let deadline = match self.pending().get(&request_id) {
                Some(p) => p.last_activity + timeout,
                None => return,
            };
            tokio::time::sleep_until(deadline).await;
            let expired = {
                let mut pending = self.pending();
                match pending.get(&request_id) {
                    None => return,
                    Some(p) if Instant::now() >= p.last_activity + timeout => pending.remove(&request_id),
                    Some(_) => None,
                }
            };
            if let Some(p) = expired {
                tracing::debug!(peer = %p.to, request = %request_id, "rpc: request timed out");
                let _ = p.events.send(RequestEvent::Error(RequestError::Timeout));
                return;
            }
        }
    }

    /// Dispatch one inbound node-to-node message.
    pub async fn handle_inbound(&self, inbound: InboundMessage) {
        let InboundMessage { from, message } = inbound;
        match message {
            NodeToNodeMessage::RequestToNode {
                request_id,
                request_body,
            } => self.on_request(from, request_id, request_body).await,
            NodeToNodeMessage::RequestToNodeResponseReceived {
                request_id,
                response_index,
            } => {
                let active = self.active().get(&(from, request_id)).cloned();
                if let Some(active) = active {
                    active.acknowledged(response_index);
                }
            }
            NodeToNodeMessage::CancelRequestToNode { request_id } => {
                let active = self.active().get(&(from.clone(), request_id.clone())).cloned();
                if let Some(active) = active {
                    tracing::debug!(peer = %from, request = %request_id, "rpc: request canceled by requester");
                    active.cancel();
                }
            }
            NodeToNodeMessage::RequestToNodeReceived { request_id } => {
                if let Some(p) = self.pending().get_mut(&request_id).filter(|p| p.to == from) {
                    p.last_activity = Instant::now();
                }
            }
            NodeToNodeMessage::RequestToNodeResponse {
                request_id,
                response_index,
                response_body,
            } => {
                self.on_response(from, request_id, response_index, response_body)
                    .await
            }
            NodeToNodeMessage::RequestToNodeFinished {
                request_id,
                num_responses,
            } => {
                let mut pending = self.pending();
                let complete = match pending.get_mut(&request_id).filter(|p| p.to == from) {
                    Some(p) => {
                        p.responses.set_total(num_responses);
                        p.last_activity = Instant::now();
                        p.responses.is_complete()
                    }
                    None => false,
                };
                if complete {
                    if let Some(p) = pending.remove(&request_id) {
                        let _ = p.events.send(RequestEvent::Finished);
                    }
                }
            }
            NodeToNodeMessage::RequestToNodeError {
                request_id,
                error_string,
            } => {
                let mut pending = self.pending();
                if pending.get(&request_id).is_some_and(|p| p.to == from) {
                    if let Some(p) = pending.remove(&request_id) {
                        let _ = p.events.send(RequestEvent::Error(RequestError::Remote(error_string)));
                    }
                }
            }
        }
    }

    async fn on_response(&self, from: NodeId, request_id: String, index: u64, body: Value) {
        let known = {
            let mut pending = self.pending();
            let (known, complete) = match pending.get_mut(&request_id).filter(|p| p.to == from) {
                Some(p) => {
                    p.last_activity = Instant::now();
                    for ready in p.responses.push(index, body) {
                        let _ = p.events.send(RequestEvent::Response(ready));
                    }
                    (true, p.responses.is_complete())
                }
                None => (false, false),
            };
            if complete {
                if let Some(p) = pending.remove(&request_id) {
                    let _ = p.events.send(RequestEvent::Finished);
                }
            }
            known
        };
        if !known {
            tracing::trace!(peer = %from, request = %request_id, "rpc: response for unknown request ignored");
            return;
        }
        let ack = NodeToNodeMessage::RequestToNodeResponseReceived {
            request_id,
            response_index: index,
        };
        if let Err(e) = self.inner.peers.send(&from, ack).await {
            tracing::debug!(peer = %from, "rpc: response acknowledgment not sent: {e}");
        }
    }

    async fn on_request(&self, from: NodeId, request_id: String, body: Value) {
        let key = (from.clone(), request_id.clone());
        let active = {
            let mut active = self.active();
            if active.contains_key(&key) {
                tracing::debug!(peer = %from, request = %request_id, "rpc: duplicate request ignored");
                return;
            }
            let (canceled, _) = watch::channel(false);
            let (progress, _) = watch::channel(0);
            let entry = Arc::new(ActiveIncoming {
                from: from.clone(),
                request_id: request_id.clone(),
                state: Mutex::new(ActiveState::default()),
                canceled,
                progress,
            });
            active.insert(key, entry.clone());
            entry
        };

        let received = NodeToNodeMessage::RequestToNodeReceived {
            request_id: request_id.clone(),
        };
        if let Err(e) = self.inner.peers.send(&from, received).await {
            tracing::debug!(peer = %from, request = %request_id, "rpc: receipt not sent: {e}");
        }

        let responder = Responder {
            protocol: self.clone(),
            active,
        };
        self.inner.handler.on_request(
            IncomingRequest {
                from,
                request_id,
                body,
            },
            responder,
        );
    }

    /// The peer is gone: fail everything waiting on it.
    pub fn peer_lost(&self, node_id: &str) {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.to == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for p in &failed {
            let _ = p
                .events
                .send(RequestEvent::Error(RequestError::ConnectionLost(node_id.to_string())));
        }
        let orphaned: Vec<Arc<ActiveIncoming>> = {
            let mut active = self.active();
            let keys: Vec<(NodeId, String)> = active.keys().filter(|(from, _)| from == node_id).cloned().collect();
            keys.iter().filter_map(|k| active.remove(k)).collect()
        };
        for a in &orphaned {
            a.cancel();
        }
        if !failed.is_empty() || !orphaned.is_empty() {
            tracing::info!(
                peer = %node_id,
                failed = failed.len(),
                abandoned = orphaned.len(),
                "rpc: peer lost, requests ended"
            );
        }
    }
}

/// Drive the protocol: inbound messages and peer loss, until shutdown.
/// A peer left without any open session fails its in-flight requests.
pub async fn run_request_loop(
    protocol: RequestProtocol,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    mut events: broadcast::Receiver<PeerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => protocol.handle_inbound(message).await,
                None => break,
            },
            event = events.recv() => match event {
                Ok(PeerEvent::Lost { node_id } | PeerEvent::Unreachable { node_id }) => protocol.peer_lost(&node_id),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "rpc: peer events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => {
                tracing::info!("rpc: shutdown signal, stopping request loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{link, spawn_node, TestNode};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    type HandlerFn = dyn Fn(IncomingRequest, Responder) + Send + Sync;

    struct FnHandler(Box<HandlerFn>);

    impl RequestHandler for FnHandler {
        fn on_request(&self, request: IncomingRequest, responder: Responder) {
            (self.0)(request, responder)
        }
    }

    fn node(handler: impl Fn(IncomingRequest, Responder) + Send + Sync + 'static) -> TestNode {
        spawn_node(Arc::new(FnHandler(Box::new(handler))))
    }

    fn silent() -> impl Fn(IncomingRequest, Responder) + Send + Sync + 'static {
        |_, _| {}
    }

    #[tokio::test]
    async fn test_ping_pong_in_order() {
        let a = node(silent());
        let b = node(|req, responder| {
            assert_eq!(req.body, json!({ "op": "ping" }));
            tokio::spawn(async move {
                responder.send_response(json!({ "pong": true })).await.unwrap();
                responder.report_finished().await;
            });
        });
        link(&a, &b).await;

        let mut handle = a
            .protocol
            .make_request(b.id.node_id(), json!({ "op": "ping" }), Some(Duration::from_millis(1000)))
            .await
            .unwrap();
        assert_eq!(handle.next().await, Some(RequestEvent::Response(json!({ "pong": true }))));
        assert_eq!(handle.next().await, Some(RequestEvent::Finished));
        assert_eq!(handle.next().await, None);
        assert_eq!(a.protocol.pending_count(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.protocol.active_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_responses_then_finished() {
        let a = node(silent());
        let b = node(|_, responder| {
            tokio::spawn(async move { responder.report_finished().await });
        });
        link(&a, &b).await;
        let handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        assert_eq!(handle.collect().await.unwrap(), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn test_remote_error_is_verbatim_and_terminal() {
        let a = node(silent());
        let b = node(|_, responder| {
            tokio::spawn(async move {
                responder.report_error("File not found.").await;
                // Already completed: both are no-ops
                responder.report_finished().await;
                assert_eq!(responder.send_response(json!(1)).await, Err(RequestError::Completed));
            });
        });
        link(&a, &b).await;
        let handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        let err = handle.collect().await.unwrap_err();
        assert_eq!(err, RequestError::Remote("File not found.".into()));
        assert_eq!(err.to_string(), "File not found.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let a = node(silent());
        let b = node(silent());
        link(&a, &b).await;

        let start = Instant::now();
        let mut handle = a
            .protocol
            .make_request(b.id.node_id(), json!({}), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        let event = handle.next().await;
        let elapsed = start.elapsed();
        assert_eq!(event, Some(RequestEvent::Error(RequestError::Timeout)));
        assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "fired late: {elapsed:?}");
        assert_eq!(RequestError::Timeout.to_string(), "Timeout while waiting for response.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_extends_timeout() {
        let a = node(silent());
        let b = node(|_, responder| {
            tokio::spawn(async move {
                for i in 0..3 {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    responder.send_response(json!(i)).await.unwrap();
                }
                responder.report_finished().await;
            });
        });
        link(&a, &b).await;
        let handle = a
            .protocol
            .make_request(b.id.node_id(), json!({}), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(handle.collect().await.unwrap(), vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_cancel_reaches_responder() {
        let a = node(silent());
        let canceled = Arc::new(AtomicBool::new(false));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let flag = canceled.clone();
        let b = node(move |_, responder| {
            let flag = flag.clone();
            let seen_tx = seen_tx.clone();
            responder.on_canceled(move || flag.store(true, Ordering::SeqCst));
            tokio::spawn(async move {
                let _ = seen_tx.send(());
                responder.canceled().await;
                assert!(responder.is_canceled());
                responder.report_error("Canceled.").await;
            });
        });
        link(&a, &b).await;

        let mut handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        seen_rx.recv().await.unwrap();
        handle.cancel().await;
        assert_eq!(handle.next().await, Some(RequestEvent::Error(RequestError::Canceled)));
        assert_eq!(handle.next().await, None);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !canceled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_request_without_connection_fails_fast() {
        let a = node(silent());
        let err = a
            .protocol
            .make_request(&"33".repeat(32), json!({}), None)
            .await
            .err()
            .unwrap();
        assert_eq!(err, RequestError::Send("No connection".into()));
        assert_eq!(a.protocol.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_loss_fails_pending() {
        let a = node(silent());
        let b = node(silent());
        link(&a, &b).await;
        let mut handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        a.protocol.peer_lost(b.id.node_id());
        assert_eq!(
            handle.next().await,
            Some(RequestEvent::Error(RequestError::ConnectionLost(b.id.node_id().to_string())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_disconnect_fails_pending_without_timeout() {
        let a = node(silent());
        let b = node(silent());
        link(&a, &b).await;
        let mut handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        // Request and receipt both confirmed: nothing left for the resend sweep
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.peers.link(b.id.node_id()).await.unwrap().disconnect();
        assert!(!a.peers.has_connection(b.id.node_id()).await);
        let event = tokio::time::timeout(Duration::from_secs(600), handle.next())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(RequestEvent::Error(RequestError::ConnectionLost(b.id.node_id().to_string())))
        );
        assert_eq!(a.protocol.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_fails_pending_and_abandons_incoming() {
        let a = node(silent());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let b = node(move |_, _| {
            let _ = seen_tx.send(());
        });
        link(&a, &b).await;
        let mut handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        seen_rx.recv().await.unwrap();
        assert_eq!(b.protocol.active_count(), 1);

        b.peers.halt_all().await;
        let event = tokio::time::timeout(Duration::from_secs(5), handle.next())
            .await
            .unwrap();
        assert!(matches!(event, Some(RequestEvent::Error(RequestError::ConnectionLost(_)))));
        tokio::time::timeout(Duration::from_secs(5), async {
            while b.protocol.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_backlog_waits_for_acknowledgments() {
        let a = node(silent());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let b = node(move |_, responder| {
            let done_tx = done_tx.clone();
            let acked = Arc::new(Mutex::new(Vec::new()));
            let log = acked.clone();
            responder.on_response_received(move |i| log.lock().unwrap().push(i));
            tokio::spawn(async move {
                for i in 0..10u64 {
                    responder
                        .wait_for_backlog(3, Duration::from_secs(5))
                        .await
                        .unwrap();
                    assert!(responder.num_unacknowledged() <= 3);
                    responder.send_response(json!(i)).await.unwrap();
                }
                responder.wait_for_backlog(0, Duration::from_secs(5)).await.unwrap();
                responder.report_finished().await;
                let mut acked = acked.lock().unwrap().clone();
                acked.sort_unstable();
                let _ = done_tx.send(acked);
            });
        });
        link(&a, &b).await;
        let handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        let responses = handle.collect().await.unwrap();
        assert_eq!(responses, (0..10).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(done_rx.recv().await.unwrap(), (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_timeout_without_acknowledgments() {
        let a = node(silent());
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let b = node(move |_, responder| {
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                responder.send_response(json!(0)).await.unwrap();
                let _ = result_tx.send(responder.wait_for_backlog(0, Duration::from_secs(5)).await);
            });
        });
        link(&a, &b).await;
        // Drop the pending entry so acknowledgments are never sent
        let handle = a.protocol.make_request(b.id.node_id(), json!({}), None).await.unwrap();
        drop(handle);
        assert_eq!(result_rx.recv().await.unwrap(), Err(RequestError::Timeout));
    }

    #[test]
    fn test_response_buffer_waits_for_gap() {
        let mut buf = ResponseBuffer::default();
        assert!(buf.push(1, json!(1)).is_empty());
        assert!(buf.push(2, json!(2)).is_empty());
        buf.set_total(3);
        assert!(!buf.is_complete());
        assert_eq!(buf.push(0, json!(0)), vec![json!(0), json!(1), json!(2)]);
        assert!(buf.is_complete());
        // Late duplicate
        assert!(buf.push(1, json!("dup")).is_empty());
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_delivers_in_order(
            order in (1usize..40).prop_flat_map(|k| Just((0..k as u64).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let k = order.len() as u64;
            let mut buf = ResponseBuffer::default();
            buf.set_total(k);
            let mut delivered = Vec::new();
            for (n, &i) in order.iter().enumerate() {
                prop_assert!(!buf.is_complete());
                delivered.extend(buf.push(i, json!(i)));
                if n + 1 < order.len() {
                    prop_assert!(buf.next_expected() < k);
                }
            }
            prop_assert!(buf.is_complete());
            prop_assert_eq!(delivered, (0..k).map(|i| json!(i)).collect::<Vec<_>>());
        }
    }
}
