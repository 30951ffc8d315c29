//! Test harness for in-process tessera-node integration tests.
//!
//! Provides TestNode (a full node on loopback sockets with its status API
//! served) and TestNodeBuilder (config), all in the same tokio runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_crypto::NodeIdentity;
use tessera_node::config::{NodeConfig, RequestsSection};
use tessera_node::handlers::RequestHandlers;
use tessera_node::node::Node;
use tessera_node::peer_link::RemoteInfo;
use tessera_node::request_protocol::{IncomingRequest, RequestHandler, Responder};
use tessera_node::transport::TransportKind;
use tessera_protocol::FileKey;
use tessera_storage::{FileStore, FsFileStore};

type HandlerFn = dyn Fn(IncomingRequest, Responder) + Send + Sync;

/// Request handler built from a closure.
pub struct FnHandler(Box<HandlerFn>);

impl FnHandler {
    pub fn new(f: impl Fn(IncomingRequest, Responder) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self(Box::new(f)))
    }
}

impl RequestHandler for FnHandler {
    fn on_request(&self, request: IncomingRequest, responder: Responder) {
        (self.0)(request, responder)
    }
}

pub struct TestNodeBuilder {
    websocket: bool,
    udp_first: bool,
    requests: RequestsSection,
    handler: Option<Arc<dyn RequestHandler>>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new() -> Self {
        Self {
            websocket: false,
            udp_first: false,
            requests: RequestsSection::default(),
            handler: None,
        }
    }

    /// Also listen for WebSocket connections.
    pub fn websocket(mut self) -> Self {
        self.websocket = true;
        self
    }

    pub fn udp_first(mut self) -> Self {
        self.udp_first = true;
        self
    }

    pub fn requests(mut self, requests: RequestsSection) -> Self {
        self.requests = requests;
        self
    }

    /// Serve requests with `handler` instead of the file handlers.
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub async fn start(self) -> anyhow::Result<TestNode> {
        let tempdir = tempfile::tempdir()?;
        let identity = Arc::new(NodeIdentity::load_or_create(&tempdir.path().join("node.key"))?);
        let store = Arc::new(FsFileStore::open(&tempdir.path().join("files"))?);

        let mut cfg = NodeConfig::default();
        cfg.network.udp_listen_addr = "127.0.0.1:0".into();
        cfg.network.websocket_listen_addr = self.websocket.then(|| "127.0.0.1:0".to_string());
        cfg.network.udp_first = self.udp_first;
        cfg.requests = self.requests.clone();

        let handler: Arc<dyn RequestHandler> = match self.handler {
            Some(h) => h,
            None => Arc::new(RequestHandlers::new(store.clone(), self.requests)),
        };
        let node = Node::start_with_handler(&cfg, identity.clone(), handler).await?;

        let bearer_token = "test-token".to_string();
        let router = tessera_api::router(Arc::new(node.api_state(bearer_token.clone())));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let api_addr = listener.local_addr()?;
        let mut shutdown = node.subscribe_shutdown();
        let api = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        });

        Ok(TestNode {
            node,
            identity,
            store,
            api_addr,
            bearer_token,
            _tempdir: tempdir,
            _api: api,
        })
    }
}

/// A running in-process node.
pub struct TestNode {
    pub node: Node,
    pub identity: Arc<NodeIdentity>,
    pub store: Arc<FsFileStore>,
    pub api_addr: SocketAddr,
    pub bearer_token: String,
    _tempdir: tempfile::TempDir,
    _api: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start() -> anyhow::Result<Self> {
        TestNodeBuilder::new().start().await
    }

    pub fn node_id(&self) -> &str {
        self.node.node_id()
    }

    pub fn store_file(&self, data: &[u8]) -> FileKey {
        FileKey {
            sha256: self.store.store(data).unwrap(),
        }
    }

    /// How to reach this node over `kind` only.
    pub fn remote_info(&self, kind: TransportKind) -> RemoteInfo {
        match kind {
            TransportKind::Udp => RemoteInfo {
                udp_addr: Some(self.node.udp_addr()),
                websocket_url: None,
            },
            TransportKind::WebSocket => RemoteInfo {
                udp_addr: None,
                websocket_url: self.node.websocket_addr().map(|a| format!("ws://{a}")),
            },
        }
    }

    /// Configure `other` as a static peer reachable over `kind`, and wait
    /// until the outgoing connection is up.
    pub async fn connect_to(&self, other: &TestNode, kind: TransportKind) -> anyhow::Result<()> {
        self.node
            .peers()
            .add_static_peer(other.node_id(), other.remote_info(kind))
            .await;
        self.wait_connected(other.node_id(), Duration::from_secs(10)).await?;
        other.wait_connected(self.node_id(), Duration::from_secs(10)).await
    }

    /// Poll until a session with `node_id` exists, or timeout.
    pub async fn wait_connected(&self, node_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.node.peers().has_connection(node_id).await {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for connection to {node_id}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// POST to the node's status API and return the JSON body.
    pub async fn api_post(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("http://{}{}", self.api_addr, path);
        let resp = reqwest::Client::new()
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.bearer_token))
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await?;
        anyhow::ensure!(resp.status().is_success(), "API returned {}", resp.status());
        Ok(resp.json().await?)
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
