//! Signed sessions over a raw connection.
//!
//! The first frame in each direction is an identity handshake. After that,
//! every frame carries the sender's node id and an Ed25519 signature over the
//! canonical JSON body; a frame that fails verification, or claims to come
//! from anyone but the session's remote node, closes the connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use tessera_crypto::NodeIdentity;
use tessera_protocol::codec::{decode_frame, encode_frame};
use tessera_protocol::{FrameBody, NodeId, PeerMessage, ProtocolError, SessionHandshake, SignedFrame, PROTOCOL_VERSION};

use crate::transport::{ConnectionHandle, RawConnection, TransportError};

/// An authenticated connection to one remote node.
pub struct Session {
    pub remote_node_id: NodeId,
    pub sender: SessionSender,
    pub receiver: SessionReceiver,
}

#[derive(Clone)]
pub struct SessionSender {
    handle: ConnectionHandle,
    identity: Arc<NodeIdentity>,
}

impl SessionSender {
    pub fn send(&self, message: &PeerMessage) -> Result<(), TransportError> {
        send_signed(&self.handle, &self.identity, message)
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

pub struct SessionReceiver {
    handle: ConnectionHandle,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    remote_node_id: NodeId,
}

impl SessionReceiver {
    /// Next verified message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<PeerMessage> {
        loop {
            let bytes = self.inbound.recv().await?;
            let frame = match verify_frame(&bytes) {
                Ok(frame) => frame,
                Err(reason) => {
                    tracing::warn!(
                        remote = %self.remote_node_id,
                        connection = %self.handle.id(),
                        "session: {reason}, closing connection"
                    );
                    self.handle.close();
                    return None;
                }
            };
            if frame.body.from_node_id != self.remote_node_id {
                tracing::warn!(
                    remote = %self.remote_node_id,
                    claimed = %frame.body.from_node_id,
                    "session: frame from unexpected node, closing connection"
                );
                self.handle.close();
                return None;
            }
            match serde_json::from_value::<PeerMessage>(frame.body.message) {
                Ok(message) => return Some(message),
                Err(e) => tracing::debug!(remote = %self.remote_node_id, "session: unrecognized message dropped: {e}"),
            }
        }
    }
}

fn send_signed<T: Serialize>(
    handle: &ConnectionHandle,
    identity: &NodeIdentity,
    message: &T,
) -> Result<(), TransportError> {
    let body = FrameBody {
        from_node_id: identity.node_id().to_string(),
        message: serde_json::to_value(message).map_err(ProtocolError::from)?,
    };
    let signature = tessera_crypto::sign(&body, identity)?;
    let bytes = encode_frame(&SignedFrame { body, signature })?;
    handle.send(bytes)
}

fn verify_frame(bytes: &[u8]) -> Result<SignedFrame, String> {
    let frame = decode_frame(bytes).map_err(|e| format!("undecodable frame ({e})"))?;
    if !tessera_crypto::verify(&frame.body, &frame.signature, &frame.body.from_node_id) {
        return Err("signature verification failed".into());
    }
    Ok(frame)
}

async fn recv_handshake<T: DeserializeOwned>(
    inbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<(NodeId, T), TransportError> {
    let bytes = inbound.recv().await.ok_or(TransportError::Closed)?;
    let frame = verify_frame(&bytes).map_err(TransportError::Handshake)?;
    let message = serde_json::from_value(frame.body.message)
        .map_err(|e| TransportError::Handshake(format!("unexpected handshake frame: {e}")))?;
    Ok((frame.body.from_node_id, message))
}

fn into_session(
    handle: ConnectionHandle,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    identity: Arc<NodeIdentity>,
    remote: NodeId,
) -> Session {
    Session {
        sender: SessionSender {
            handle: handle.clone(),
            identity,
        },
        receiver: SessionReceiver {
            handle,
            inbound,
            remote_node_id: remote.clone(),
        },
        remote_node_id: remote,
    }
}

/// Dialer side: send `initial`, wait for `accepted`.
///
/// With `expected_remote`, an acceptor claiming any other node id is rejected.
pub async fn initiate(
    raw: RawConnection,
    identity: Arc<NodeIdentity>,
    expected_remote: Option<&str>,
    timeout: Duration,
) -> Result<Session, TransportError> {
    let RawConnection { handle, mut inbound } = raw;
    let exchange = async {
        send_signed(
            &handle,
            &identity,
            &SessionHandshake::Initial {
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
        )?;
        match recv_handshake::<SessionHandshake>(&mut inbound).await? {
            (remote, SessionHandshake::Accepted) => Ok(remote),
            (_, other) => Err(TransportError::Handshake(format!("expected accepted, got {other:?}"))),
        }
    };
    let remote = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            handle.close();
            return Err(e);
        }
        Err(_) => {
            handle.close();
            return Err(TransportError::Handshake("timed out".into()));
        }
    };
    if let Some(expected) = expected_remote {
        if expected != remote {
            handle.close();
            return Err(TransportError::Handshake(format!("expected node {expected}, got {remote}")));
        }
    }
    if remote == identity.node_id() {
        handle.close();
        return Err(TransportError::Handshake("connected to self".into()));
    }
    Ok(into_session(handle, inbound, identity, remote))
}

/// Acceptor side: wait for `initial`, check it, reply `accepted`.
pub async fn accept(raw: RawConnection, identity: Arc<NodeIdentity>, timeout: Duration) -> Result<Session, TransportError> {
    let RawConnection { handle, mut inbound } = raw;
    let exchange = async {
        let (remote, hello) = recv_handshake::<SessionHandshake>(&mut inbound).await?;
        match hello {
            SessionHandshake::Initial { protocol_version } if protocol_version == PROTOCOL_VERSION => {}
            SessionHandshake::Initial { protocol_version } => {
                return Err(TransportError::Handshake(format!(
                    "protocol version mismatch: {protocol_version} (ours {PROTOCOL_VERSION})"
                )))
            }
            SessionHandshake::Accepted => return Err(TransportError::Handshake("expected initial".into())),
        }
        if remote == identity.node_id() {
            return Err(TransportError::Handshake("connection from self".into()));
        }
        send_signed(&handle, &identity, &SessionHandshake::Accepted)?;
        Ok(remote)
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(remote)) => Ok(into_session(handle, inbound, identity, remote)),
        Ok(Err(e)) => {
            handle.close();
            Err(e)
        }
        Err(_) => {
            handle.close();
            Err(TransportError::Handshake("timed out".into()))
        }
    }
}
