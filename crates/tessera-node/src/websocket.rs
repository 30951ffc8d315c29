//! WebSocket transport.
//!
//! Each session frame travels as one binary WebSocket message. The stream is
//! already reliable and ordered, so nothing here acknowledges or paces.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tessera_protocol::{random_id, ID_LEN};

use crate::transport::{connection_pair, ConnectionCommand, Direction, RawConnection, TransportError, TransportKind};

/// Dial `url` (`ws://host:port`).
pub async fn connect(url: &str) -> Result<RawConnection, TransportError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    tracing::debug!(%url, "ws: connected");
    Ok(spawn_connection(ws, Direction::Outgoing, url.to_string()))
}

/// Accept WebSocket connections until shutdown.
pub async fn run_websocket_loop(
    listener: TcpListener,
    incoming: mpsc::UnboundedSender<RawConnection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "ws: listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let incoming = incoming.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => {
                                let raw = spawn_connection(ws, Direction::Incoming, remote.to_string());
                                tracing::debug!(%remote, "ws: accepted incoming connection");
                                let _ = incoming.send(raw);
                            }
                            Err(e) => tracing::debug!(%remote, "ws: upgrade failed: {e}"),
                        }
                    });
                }
                Err(e) => tracing::warn!("ws: accept failed: {e}"),
            },
            _ = shutdown.recv() => {
                tracing::info!("ws: shutdown signal, stopping accept loop");
                break;
            }
        }
    }
}

fn spawn_connection<S>(ws: WebSocketStream<S>, direction: Direction, remote: String) -> RawConnection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (raw, mut ends) = connection_pair(random_id(ID_LEN), TransportKind::WebSocket, direction, remote);
    let id = raw.handle.id().to_string();
    tokio::spawn(async move {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                cmd = ends.commands.recv() => match cmd {
                    Some(ConnectionCommand::Send(payload)) => {
                        if let Err(e) = sink.send(Message::Binary(payload.to_vec())).await {
                            tracing::debug!(connection = %id, "ws: send failed: {e}");
                            break;
                        }
                    }
                    Some(ConnectionCommand::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => ends.deliver(Bytes::from(data)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection = %id, "ws: read failed: {e}");
                        break;
                    }
                },
            }
        }
        ends.finish();
        tracing::debug!(connection = %id, "ws: connection closed");
    });
    raw
}
