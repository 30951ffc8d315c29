//! Framed UDP link -- whole JSON envelopes over a shared datagram socket.
//!
//! Outgoing envelopes are serialized and split into fragments; incoming
//! datagrams are reassembled per source address. Loss is not handled here:
//! a message missing any fragment is simply never delivered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;

use tessera_protocol::{fragment, Reassembler, ReassemblyLimits, UdpEnvelope, DEFAULT_PARAMS};

/// Largest datagram we will read. Anything bigger is truncated by the OS and
/// fails header or JSON parsing later.
const RECV_BUFFER_BYTES: usize = 65_536;

/// Sending half. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct FramedUdpLink {
    socket: Arc<UdpSocket>,
}

impl FramedUdpLink {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serialize, fragment and send one envelope. Send failures are logged and
    /// otherwise ignored; reliability lives a layer up.
    pub async fn send_envelope(&self, to: SocketAddr, envelope: &UdpEnvelope) {
        let payload = match serde_json::to_vec(envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%to, "udp: envelope serialization failed: {e}");
                return;
            }
        };
        self.send_bytes(to, &payload).await;
    }

    async fn send_bytes(&self, to: SocketAddr, payload: &[u8]) {
        for datagram in fragment(payload) {
            if let Err(e) = self.socket.send_to(&datagram, to).await {
                tracing::debug!(%to, "udp: send_to failed: {e}");
                return;
            }
        }
    }
}

/// Receiving half. Owned by the single receive loop.
pub struct FramedReceiver {
    socket: Arc<UdpSocket>,
    reassembler: Reassembler<SocketAddr>,
    last_prune: Instant,
    buf: Vec<u8>,
}

impl FramedReceiver {
    /// Wait for the next complete message. Malformed datagrams are dropped
    /// silently; only socket errors surface.
    pub async fn recv_message(&mut self) -> std::io::Result<(SocketAddr, Bytes)> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.buf).await?;
            let now = Instant::now();
            if now.duration_since(self.last_prune) >= Duration::from_secs(1) {
                let pruned = self.reassembler.prune(now);
                if pruned > 0 {
                    tracing::debug!(pruned, "udp: stale partial messages dropped");
                }
                self.last_prune = now;
            }
            if let Some(message) = self.reassembler.push(from, &self.buf[..len], now) {
                return Ok((from, message));
            }
        }
    }

    /// Wait for the next message that parses as an envelope.
    pub async fn recv_envelope(&mut self) -> std::io::Result<(SocketAddr, UdpEnvelope)> {
        loop {
            let (from, message) = self.recv_message().await?;
            match serde_json::from_slice::<UdpEnvelope>(&message) {
                Ok(env) => return Ok((from, env)),
                Err(e) => tracing::debug!(%from, "udp: unparseable envelope dropped: {e}"),
            }
        }
    }
}

/// Bind a UDP socket and split it into link and receiver halves.
pub async fn bind(addr: SocketAddr) -> std::io::Result<(FramedUdpLink, FramedReceiver)> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let receiver = FramedReceiver {
        socket: socket.clone(),
        reassembler: Reassembler::new(ReassemblyLimits::from_params(&DEFAULT_PARAMS)),
        last_prune: Instant::now(),
        buf: vec![0u8; RECV_BUFFER_BYTES],
    };
    Ok((FramedUdpLink { socket }, receiver))
}
