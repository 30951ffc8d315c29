//! Tessera Node -- P2P file node over reliable UDP and WebSocket.
//!
//! Usage:
//!   tessera-node                      # Run with default config
//!   tessera-node --config path.toml   # Run with custom config
//!   tessera-node identity             # Show node identity

use tessera_node::config::{self, NodeConfig};
use tessera_node::node::Node;
use tessera_node::{expand_tilde, load_or_create_token};

use clap::{Parser, Subcommand};
use std::sync::Arc;

use tessera_crypto::NodeIdentity;
use tessera_storage::FsFileStore;

#[derive(Parser)]
#[command(name = "tessera-node", about = "Tessera P2P file node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.tessera/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or generate node identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Run the node (default)
    Run,
    /// Show node status (queries local API)
    Status,
    /// List known peers and their connections
    Peers,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity keypair
    Generate,
    /// Show current node identity
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_node=info,tessera_api=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Identity { action }) => {
            let key_path = expand_tilde(&cfg.node.identity_key);
            match action {
                Some(IdentityAction::Generate) | None => {
                    let identity = NodeIdentity::load_or_create(&key_path)?;
                    println!("Node ID: {}", identity.node_id());
                    println!("Key file: {}", key_path.display());
                }
                Some(IdentityAction::Show) => {
                    if key_path.exists() {
                        let identity = NodeIdentity::from_file(&key_path)?;
                        println!("Node ID: {}", identity.node_id());
                    } else {
                        eprintln!("No identity found at {}", key_path.display());
                        std::process::exit(1);
                    }
                }
            }
        }
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Status) => {
            cli_api_call(&cfg, "/api/v1/status").await?;
        }
        Some(Commands::Peers) => {
            cli_api_call(&cfg, "/api/v1/peers").await?;
        }
    }

    Ok(())
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(cfg: &config::NodeConfig, path: &str) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde(&cfg.node.token_path);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", token))
        .body("{}")
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_node(cfg: config::NodeConfig) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.identity_key);
    let identity = Arc::new(NodeIdentity::load_or_create(&key_path)?);

    tracing::info!(
        node_id = %identity.node_id(),
        version = env!("CARGO_PKG_VERSION"),
        "starting tessera-node"
    );
    tracing::info!(
        udp = %cfg.network.udp_listen_addr,
        websocket = cfg.network.websocket_listen_addr.as_deref().unwrap_or("(disabled)"),
        api_addr = %cfg.node.api_addr,
        peers = cfg.network.peers.len(),
        udp_first = cfg.network.udp_first,
        "network config"
    );

    let storage_dir = expand_tilde(&cfg.node.storage_dir);
    let store = Arc::new(FsFileStore::open(&storage_dir)?);
    tracing::info!(dir = %storage_dir.display(), "file store opened");

    let bearer_token = load_or_create_token(&expand_tilde(&cfg.node.token_path))?;

    let node = Node::start(&cfg, identity, store).await?;

    let router = tessera_api::router(Arc::new(node.api_state(bearer_token)));
    let listener = tokio::net::TcpListener::bind(cfg.node.api_addr.as_str()).await?;
    tracing::info!(addr = %cfg.node.api_addr, "API listening (HTTP)");
    let mut api_shutdown = node.subscribe_shutdown();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.recv().await;
            })
            .await
        {
            tracing::error!("API server error: {e}");
        }
    });

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    node.shutdown().await;
    let _ = api_handle.await;

    tracing::info!("tessera-node stopped");
    Ok(())
}
