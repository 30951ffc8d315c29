//! Ed25519 node identity -- keypair generation, loading, signing.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::path::Path;

use crate::CryptoError;

/// Node identity wrapping an Ed25519 keypair.
pub struct NodeIdentity {
    keypair: Ed25519KeyPair,
    node_id: String,
    pkcs8_doc: Vec<u8>,
}

impl NodeIdentity {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;
        Self::from_pkcs8_bytes(pkcs8.as_ref().to_vec())
    }

    /// Load keypair from PKCS#8 DER file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let pkcs8_bytes = std::fs::read(path)?;
        Self::from_pkcs8_bytes(pkcs8_bytes)
    }

    /// Load or create keypair at path.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let identity = Self::generate()?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &identity.pkcs8_doc)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(identity)
        }
    }

    fn from_pkcs8_bytes(pkcs8_bytes: Vec<u8>) -> Result<Self, CryptoError> {
        let keypair = Ed25519KeyPair::from_pkcs8(&pkcs8_bytes)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;
        let node_id = hex::encode(keypair.public_key().as_ref());

        Ok(Self {
            keypair,
            node_id,
            pkcs8_doc: pkcs8_bytes,
        })
    }

    /// Node id: hex of the raw public key.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key().as_ref()
    }

    /// Sign data.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keypair.sign(data).as_ref().to_vec()
    }

    /// PKCS#8 DER bytes.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_doc
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
