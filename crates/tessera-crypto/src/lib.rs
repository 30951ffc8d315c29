//! Tessera Crypto -- Ed25519 node identity and frame signatures.
//!
//! A node id is the lowercase hex encoding of the node's 32-byte Ed25519
//! public key, so any frame can be verified from the claimed sender id alone.
//!
//! Signatures cover the canonical JSON encoding of a value: object keys
//! sorted, no insignificant whitespace. Re-encoding a parsed body therefore
//! reproduces the signed bytes exactly.

use ring::signature::{UnparsedPublicKey, ED25519};
use serde::Serialize;

pub mod identity;

// Re-exports
pub use identity::NodeIdentity;

/// Ed25519 public key length in bytes.
const PUBLIC_KEY_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Canonical JSON bytes for signing.
///
/// Round-trips through `serde_json::Value`, whose object map is ordered by
/// key, so field declaration order never leaks into the signed bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Sign `body` with `identity`. Returns the hex signature.
pub fn sign<T: Serialize>(body: &T, identity: &NodeIdentity) -> Result<String, CryptoError> {
    let bytes = canonical_json(body)?;
    Ok(hex::encode(identity.sign(&bytes)))
}

/// Verify a hex `signature` over `body` against the hex `node_id` public key.
///
/// Any malformed input (bad hex, wrong key length) is simply a failed check.
pub fn verify<T: Serialize>(body: &T, signature: &str, node_id: &str) -> bool {
    let Ok(public_key) = public_key_from_node_id(node_id) else {
        return false;
    };
    let Ok(sig) = hex::decode(signature) else {
        return false;
    };
    let Ok(bytes) = canonical_json(body) else {
        return false;
    };
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(&bytes, &sig)
        .is_ok()
}

/// Decode a node id into raw public key bytes.
pub fn public_key_from_node_id(node_id: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = hex::decode(node_id).map_err(|e| CryptoError::InvalidNodeId(e.to_string()))?;
    if bytes.len() != PUBLIC_KEY_LENGTH {
        return Err(CryptoError::InvalidNodeId(format!(
            "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Cheap shape check for node ids received off the wire.
pub fn is_valid_node_id(node_id: &str) -> bool {
    public_key_from_node_id(node_id).is_ok()
}
