//! Tessera Node -- library crate for the P2P transport and request core.
//!
//! Re-exports all internal modules so integration tests and the binary can
//! drive UDP/WebSocket transports, peer links and node-to-node requests.

pub mod config;
pub mod congestion;
pub mod external_addr;
pub mod handlers;
pub mod node;
pub mod peer_link;
pub mod peer_manager;
pub mod request_protocol;
pub mod seen_ids;
pub mod session;
pub mod transport;
pub mod udp_connection;
pub mod udp_link;
pub mod udp_server;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/etc/tessera"), PathBuf::from("/etc/tessera"));
        if let Some(home) = dirs_or_home() {
            assert_eq!(expand_tilde("~/x/y"), home.join("x/y"));
        }
    }

    #[test]
    fn test_token_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("token");
        let first = load_or_create_token(&path).unwrap();
        assert_eq!(first.len(), 48);
        assert_eq!(load_or_create_token(&path).unwrap(), first);
    }
}
