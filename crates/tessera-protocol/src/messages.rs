//! Wire message types.
//!
//! Field names are camelCase on the wire. Request and response bodies are
//! carried as opaque JSON at the RPC layer; the application layer below
//! gives them types.

use serde::{Deserialize, Serialize};

use crate::NodeId;

// ============================================================================
// UDP envelopes
// ============================================================================

/// Anything that arrives on the shared UDP socket once reassembled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UdpEnvelope {
    Connection(ConnectionEnvelope),
    Handshake(HandshakeMessage),
}

/// Connection setup, sent outside any connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HandshakeMessage {
    OpenConnection {
        connection_id: String,
    },
    AcceptConnection {
        connection_id: String,
        /// The initiator's address as the acceptor saw it.
        initiator_public_endpoint: PublicEndpoint,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicEndpoint {
    pub address: String,
    pub port: u16,
}

/// A message addressed to an established connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEnvelope {
    pub connection_id: String,
    pub message: ConnectionMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConnectionMessage {
    Message {
        udp_message_id: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    ConfirmUdpMessage {
        udp_message_id: String,
    },
    Close,
}

// ============================================================================
// Peer link messages
// ============================================================================

/// Unit of at-least-once delivery between two linked nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PeerMessage {
    /// Acknowledges receipt of the message with this `_id`.
    Confirm {
        #[serde(rename = "_confirmId")]
        confirm_id: String,
    },
    Message {
        #[serde(rename = "_id")]
        id: String,
        message: NodeToNodeMessage,
    },
}

// ============================================================================
// Node-to-node requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeToNodeMessage {
    RequestToNode {
        request_id: String,
        request_body: serde_json::Value,
    },
    RequestToNodeReceived {
        request_id: String,
    },
    RequestToNodeResponse {
        request_id: String,
        response_index: u64,
        response_body: serde_json::Value,
    },
    RequestToNodeResponseReceived {
        request_id: String,
        response_index: u64,
    },
    RequestToNodeFinished {
        request_id: String,
        num_responses: u64,
    },
    RequestToNodeError {
        request_id: String,
        error_string: String,
    },
    CancelRequestToNode {
        request_id: String,
    },
}

impl NodeToNodeMessage {
    pub fn request_id(&self) -> &str {
        match self {
            Self::RequestToNode { request_id, .. }
            | Self::RequestToNodeReceived { request_id }
            | Self::RequestToNodeResponse { request_id, .. }
            | Self::RequestToNodeResponseReceived { request_id, .. }
            | Self::RequestToNodeFinished { request_id, .. }
            | Self::RequestToNodeError { request_id, .. }
            | Self::CancelRequestToNode { request_id } => request_id,
        }
    }

    /// Messages travelling requester -> responder.
    pub fn is_to_responder(&self) -> bool {
        matches!(
            self,
            Self::RequestToNode { .. }
                | Self::RequestToNodeResponseReceived { .. }
                | Self::CancelRequestToNode { .. }
        )
    }
}

// ============================================================================
// Signed session frames
// ============================================================================

/// Every frame on a session is signed by its sender over the canonical JSON
/// encoding of `body`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedFrame {
    pub body: FrameBody,
    /// Hex Ed25519 signature.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameBody {
    pub from_node_id: NodeId,
    pub message: serde_json::Value,
}

/// Identity handshake carried as the first frame in each direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionHandshake {
    Initial { protocol_version: String },
    Accepted,
}

// ============================================================================
// Application request bodies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "requestType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RequestBody {
    CheckAlive,
    CheckForFile {
        file_key: FileKey,
    },
    DownloadFile {
        file_key: FileKey,
        start_byte: u64,
        end_byte: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckAliveResponse {
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckForFileResponse {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadChunk {
    #[serde(rename = "dataB64", with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Base64 encoding for binary fields.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
