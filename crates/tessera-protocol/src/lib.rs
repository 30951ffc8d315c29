//! Tessera Protocol -- wire types, datagram framing, frame encoding.
//!
//! UDP datagrams carry fragments of JSON envelopes (64-byte ASCII header per
//! fragment). Each transport message holds one serde JSON session frame.

pub mod codec;
pub mod fragment;
pub mod messages;
pub mod params;

pub use fragment::{fragment, Reassembler, ReassemblyLimits};
pub use messages::*;
pub use params::{TransportParams, DEFAULT_PARAMS};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Session protocol version exchanged in the `initial` handshake frame.
pub const PROTOCOL_VERSION: &str = "tessera-0.1";

/// Length of fragment ids, UDP message ids and connection ids we generate.
pub const ID_LEN: usize = DEFAULT_PARAMS.id_len;

/// Maximum payload bytes per UDP fragment (sourced from default params).
pub const MAX_FRAGMENT_BYTES: usize = DEFAULT_PARAMS.max_fragment_bytes;

/// Node identifier (hex of the Ed25519 public key).
pub type NodeId = String;

/// Random alphanumeric id of the given length.
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Connection ids are chosen by the initiator; accept anything sane.
pub fn is_valid_connection_id(id: &str) -> bool {
    (DEFAULT_PARAMS.connection_id_min_len..=DEFAULT_PARAMS.connection_id_max_len)
        .contains(&id.len())
        && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
