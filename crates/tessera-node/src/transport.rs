//! Transport-neutral connection handles.
//!
//! Both the reliable UDP connection and the WebSocket connection are driven
//! by a task that owns the IO. Everything above talks to that task through a
//! `ConnectionHandle` (outbound commands, closed signal) and reads inbound
//! messages from the paired receiver.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use tessera_crypto::CryptoError;
use tessera_protocol::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No connection")]
    NoConnection,
    #[error("connection closed")]
    Closed,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug)]
pub enum ConnectionCommand {
    Send(Bytes),
    Close,
}

/// Cloneable handle to a live connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    kind: TransportKind,
    direction: Direction,
    remote: String,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    closed: watch::Receiver<bool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Remote address as the transport sees it.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Queue one message for delivery.
    pub fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.commands
            .send(ConnectionCommand::Send(payload))
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the connection task to close. Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(ConnectionCommand::Close);
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Resolves once the connection has closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A connection that has not yet been through the identity handshake.
#[derive(Debug)]
pub struct RawConnection {
    pub handle: ConnectionHandle,
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

/// The task-side ends of a connection.
#[derive(Debug)]
pub struct ConnectionEnds {
    pub commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    pub inbound: mpsc::UnboundedSender<Bytes>,
    pub closed: watch::Sender<bool>,
}

impl ConnectionEnds {
    /// Deliver one inbound message to whoever holds the `RawConnection`.
    pub fn deliver(&self, payload: Bytes) {
        let _ = self.inbound.send(payload);
    }

    /// Mark the connection closed for every handle.
    pub fn finish(&self) {
        self.closed.send_replace(true);
    }
}

pub fn connection_pair(
    id: String,
    kind: TransportKind,
    direction: Direction,
    remote: String,
) -> (RawConnection, ConnectionEnds) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let handle = ConnectionHandle {
        id,
        kind,
        direction,
        remote,
        commands: cmd_tx,
        closed: closed_rx,
    };
    (
        RawConnection {
            handle,
            inbound: in_rx,
        },
        ConnectionEnds {
            commands: cmd_rx,
            inbound: in_tx,
            closed: closed_tx,
        },
    )
}

/// Two in-memory connections wired back to back. Closing either closes both.
#[cfg(test)]
pub(crate) fn loopback_pair(kind: TransportKind) -> (RawConnection, RawConnection) {
    let id = tessera_protocol::random_id(tessera_protocol::ID_LEN);
    let (a, mut a_ends) = connection_pair(id.clone(), kind, Direction::Outgoing, "b".into());
    let (b, mut b_ends) = connection_pair(id, kind, Direction::Incoming, "a".into());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = a_ends.commands.recv() => match cmd {
                    Some(ConnectionCommand::Send(p)) => b_ends.deliver(p),
                    _ => break,
                },
                cmd = b_ends.commands.recv() => match cmd {
                    Some(ConnectionCommand::Send(p)) => a_ends.deliver(p),
                    _ => break,
                },
            }
        }
        a_ends.finish();
        b_ends.finish();
    });
    (a, b)
}
