//! Configuration types for tessera-node.
//! Parsed from ~/.tessera/config.toml.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use tessera_protocol::{TransportParams, DEFAULT_PARAMS};

use crate::peer_link::RemoteInfo;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub requests: RequestsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            storage_dir: default_storage_dir(),
            api_addr: default_api_addr(),
            token_path: default_token_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_udp_listen_addr")]
    pub udp_listen_addr: String,
    pub websocket_listen_addr: Option<String>,
    /// Our externally reachable UDP address, if known in advance.
    pub public_udp_addr: Option<String>,
    /// Prefer UDP over WebSocket when both are connected.
    #[serde(default)]
    pub udp_first: bool,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            udp_listen_addr: default_udp_listen_addr(),
            websocket_listen_addr: None,
            public_udp_addr: None,
            udp_first: false,
            peers: Vec::new(),
        }
    }
}

/// A statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    pub udp_addr: Option<String>,
    /// e.g. `ws://host:port`
    pub websocket_addr: Option<String>,
}

impl PeerEntry {
    pub fn remote_info(&self) -> anyhow::Result<RemoteInfo> {
        let udp_addr = match &self.udp_addr {
            Some(a) => Some(
                a.parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("peer {}: bad udp_addr {a}: {e}", self.node_id))?,
            ),
            None => None,
        };
        Ok(RemoteInfo {
            udp_addr,
            websocket_url: self.websocket_addr.clone(),
        })
    }
}

/// Congestion defaults. Empirical starting points; override per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_initial_bytes_per_sec")]
    pub initial_bytes_per_sec: f64,
    #[serde(default = "default_initial_rtt_ms")]
    pub initial_rtt_ms: f64,
    #[serde(default = "default_target_loss_pct")]
    pub target_loss_pct: f64,
    #[serde(default = "default_trial_duration_ms")]
    pub trial_duration_ms: u64,
    #[serde(default = "default_rate_step")]
    pub rate_step: f64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            initial_bytes_per_sec: default_initial_bytes_per_sec(),
            initial_rtt_ms: default_initial_rtt_ms(),
            target_loss_pct: default_target_loss_pct(),
            trial_duration_ms: default_trial_duration_ms(),
            rate_step: default_rate_step(),
        }
    }
}

impl TransportSection {
    /// Default parameters with this section's overrides applied.
    pub fn params(&self) -> TransportParams {
        TransportParams {
            initial_bytes_per_sec: self.initial_bytes_per_sec,
            initial_rtt_ms: self.initial_rtt_ms,
            target_loss_pct: self.target_loss_pct,
            trial_duration_ms: self.trial_duration_ms,
            rate_step: self.rate_step,
            ..DEFAULT_PARAMS
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsSection {
    #[serde(default = "default_35")]
    pub max_unacknowledged_responses: u64,
    #[serde(default = "default_5000")]
    pub backlog_timeout_ms: u64,
    #[serde(default = "default_chunk_bytes")]
    pub download_chunk_bytes: usize,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
}

impl Default for RequestsSection {
    fn default() -> Self {
        Self {
            max_unacknowledged_responses: 35,
            backlog_timeout_ms: 5000,
            download_chunk_bytes: default_chunk_bytes(),
            max_download_bytes: default_max_download_bytes(),
        }
    }
}

// Default value functions
fn default_identity_key() -> String {
    "~/.tessera/node.key".into()
}
fn default_storage_dir() -> String {
    "~/.tessera/files".into()
}
fn default_api_addr() -> String {
    "127.0.0.1:9483".into()
}
fn default_token_path() -> String {
    "~/.tessera/node-token".into()
}
fn default_udp_listen_addr() -> String {
    "0.0.0.0:9484".into()
}
fn default_initial_bytes_per_sec() -> f64 {
    DEFAULT_PARAMS.initial_bytes_per_sec
}
fn default_initial_rtt_ms() -> f64 {
    DEFAULT_PARAMS.initial_rtt_ms
}
fn default_target_loss_pct() -> f64 {
    DEFAULT_PARAMS.target_loss_pct
}
fn default_trial_duration_ms() -> u64 {
    DEFAULT_PARAMS.trial_duration_ms
}
fn default_rate_step() -> f64 {
    DEFAULT_PARAMS.rate_step
}
fn default_35() -> u64 {
    35
}
fn default_5000() -> u64 {
    5000
}
fn default_chunk_bytes() -> usize {
    15_000
}
fn default_max_download_bytes() -> u64 {
    20 * 1000 * 1000
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.requests.max_unacknowledged_responses, 35);
        assert_eq!(cfg.requests.download_chunk_bytes, 15_000);
        assert!(!cfg.network.udp_first);
        assert_eq!(cfg.transport.params(), DEFAULT_PARAMS);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[node]
identity_key = "/var/lib/tessera/node.key"
api_addr = "127.0.0.1:7000"

[network]
udp_listen_addr = "0.0.0.0:7001"
websocket_listen_addr = "0.0.0.0:7002"
udp_first = true

[[network.peers]]
node_id = "ab12"
udp_addr = "203.0.113.9:7001"

[[network.peers]]
node_id = "cd34"
websocket_addr = "ws://203.0.113.10:7002"

[transport]
initial_bytes_per_sec = 500000.0
rate_step = 1.5
"#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.node.identity_key, "/var/lib/tessera/node.key");
        assert_eq!(cfg.node.storage_dir, "~/.tessera/files");
        assert_eq!(cfg.network.websocket_listen_addr.as_deref(), Some("0.0.0.0:7002"));
        assert!(cfg.network.udp_first);
        assert_eq!(cfg.network.peers.len(), 2);

        let params = cfg.transport.params();
        assert_eq!(params.initial_bytes_per_sec, 500_000.0);
        assert_eq!(params.rate_step, 1.5);
        assert_eq!(params.target_loss_pct, DEFAULT_PARAMS.target_loss_pct);
        assert_eq!(params.max_udp_tries, DEFAULT_PARAMS.max_udp_tries);

        let info = cfg.network.peers[0].remote_info().unwrap();
        assert_eq!(info.udp_addr, Some("203.0.113.9:7001".parse().unwrap()));
        assert_eq!(info.websocket_url, None);
        let info = cfg.network.peers[1].remote_info().unwrap();
        assert_eq!(info.websocket_url.as_deref(), Some("ws://203.0.113.10:7002"));
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.node.api_addr, "127.0.0.1:9483");
        assert_eq!(cfg.requests.backlog_timeout_ms, 5000);
    }

    #[test]
    fn test_bad_peer_address() {
        let entry = PeerEntry {
            node_id: "ab".into(),
            udp_addr: Some("nope".into()),
            websocket_addr: None,
        };
        assert!(entry.remote_info().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.network.udp_listen_addr, "0.0.0.0:9484");
    }
}
