//! Application request handlers: liveness, file lookup and ranged download.
//!
//! Downloads stream the requested range in fixed-size chunks, holding back
//! while too many chunks are unacknowledged so a slow requester throttles
//! the sender.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use tessera_protocol::{CheckAliveResponse, CheckForFileResponse, DownloadChunk, FileKey, RequestBody};
use tessera_storage::FileStore;

use crate::config::RequestsSection;
use crate::request_protocol::{
    IncomingRequest, RequestError, RequestEvent, RequestHandler, RequestProtocol, Responder,
};

pub const BACKLOG_TIMEOUT_ERROR: &str = "Timeout while waiting for confirmation of receipt of messages.";
pub const DOWNLOAD_CANCELED_ERROR: &str = "Download canceled by requester.";

/// Serves requests from the local file store.
#[derive(Clone)]
pub struct RequestHandlers {
    store: Arc<dyn FileStore>,
    limits: RequestsSection,
}

impl RequestHandlers {
    pub fn new(store: Arc<dyn FileStore>, limits: RequestsSection) -> Self {
        Self { store, limits }
    }

    async fn handle(self, body: RequestBody, responder: Responder) {
        match body {
            RequestBody::CheckAlive => {
                respond_once(&responder, &CheckAliveResponse { alive: true }).await;
            }
            RequestBody::CheckForFile { file_key } => match self.store.find_file(&file_key.sha256) {
                Ok(info) => {
                    let response = CheckForFileResponse {
                        found: info.is_some(),
                        size: info.map(|i| i.size),
                    };
                    respond_once(&responder, &response).await;
                }
                Err(e) => responder.report_error(format!("Error checking for file: {e}")).await,
            },
            RequestBody::DownloadFile {
                file_key,
                start_byte,
                end_byte,
            } => self.download(responder, file_key, start_byte, end_byte).await,
        }
    }

    async fn download(&self, responder: Responder, file_key: FileKey, start: u64, end: u64) {
        if start >= end {
            responder
                .report_error(format!("Invalid range: startByte ({start}) must be less than endByte ({end})."))
                .await;
            return;
        }
        if end - start > self.limits.max_download_bytes {
            responder
                .report_error(format!(
                    "Requested range of {} bytes exceeds the maximum of {} bytes.",
                    end - start,
                    self.limits.max_download_bytes
                ))
                .await;
            return;
        }
        let size = match self.store.find_file(&file_key.sha256) {
            Ok(Some(info)) => info.size,
            Ok(None) => {
                responder.report_error("File not found.").await;
                return;
            }
            Err(e) => {
                responder.report_error(format!("Error checking for file: {e}")).await;
                return;
            }
        };
        if end > size {
            responder
                .report_error(format!("Range end ({end}) is beyond the file size ({size})."))
                .await;
            return;
        }

        tracing::debug!(peer = %responder.requester(), file = %file_key.sha256, start, end, "download: streaming range");
        let chunk_bytes = self.limits.download_chunk_bytes.max(1) as u64;
        let backlog = self.limits.max_unacknowledged_responses;
        let timeout = Duration::from_millis(self.limits.backlog_timeout_ms);

        let mut pos = start;
        while pos < end {
            if !self.wait_backlog(&responder, backlog, timeout).await {
                return;
            }
            let chunk_end = (pos + chunk_bytes).min(end);
            let data = match self.store.read_range(&file_key.sha256, pos, chunk_end) {
                Ok(data) => data,
                Err(e) => {
                    responder.report_error(format!("Error reading file: {e}")).await;
                    return;
                }
            };
            let chunk = match serde_json::to_value(DownloadChunk { data }) {
                Ok(v) => v,
                Err(e) => {
                    responder.report_error(format!("Error encoding chunk: {e}")).await;
                    return;
                }
            };
            if let Err(e) = responder.send_response(chunk).await {
                tracing::debug!(peer = %responder.requester(), "download: aborted: {e}");
                return;
            }
            pos = chunk_end;
        }

        if self.wait_backlog(&responder, 0, timeout).await {
            responder.report_finished().await;
        }
    }

    /// False (with the request already failed) if the download must stop.
    async fn wait_backlog(&self, responder: &Responder, max_outstanding: u64, timeout: Duration) -> bool {
        if responder.is_canceled() {
            responder.report_error(DOWNLOAD_CANCELED_ERROR).await;
            return false;
        }
        match responder.wait_for_backlog(max_outstanding, timeout).await {
            Ok(()) => true,
            Err(RequestError::Canceled) => {
                responder.report_error(DOWNLOAD_CANCELED_ERROR).await;
                false
            }
            Err(_) => {
                tracing::warn!(peer = %responder.requester(), "download: requester stopped acknowledging");
                responder.report_error(BACKLOG_TIMEOUT_ERROR).await;
                false
            }
        }
    }
}

impl RequestHandler for RequestHandlers {
    fn on_request(&self, request: IncomingRequest, responder: Responder) {
        let handlers = self.clone();
        tokio::spawn(async move {
            match serde_json::from_value::<RequestBody>(request.body) {
                Ok(body) => handlers.handle(body, responder).await,
                Err(e) => {
                    tracing::debug!(peer = %request.from, "rpc: unrecognized request body: {e}");
                    responder.report_error(format!("Invalid request: {e}")).await;
                }
            }
        });
    }
}

async fn respond_once<T: serde::Serialize>(responder: &Responder, response: &T) {
    let value = match serde_json::to_value(response) {
        Ok(v) => v,
        Err(e) => {
            responder.report_error(format!("Error encoding response: {e}")).await;
            return;
        }
    };
    if responder.send_response(value).await.is_ok() {
        responder.report_finished().await;
    }
}

// ============================================================================
// Client helpers
// ============================================================================

fn encode_body(body: &RequestBody) -> Result<Value, RequestError> {
    serde_json::to_value(body).map_err(|e| RequestError::InvalidResponse(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RequestError> {
    serde_json::from_value(value).map_err(|e| RequestError::InvalidResponse(e.to_string()))
}

/// Expect exactly one response before finish.
async fn single_response<T: DeserializeOwned>(
    protocol: &RequestProtocol,
    to: &str,
    body: &RequestBody,
    timeout: Duration,
) -> Result<T, RequestError> {
    let responses = protocol
        .make_request(to, encode_body(body)?, Some(timeout))
        .await?
        .collect()
        .await?;
    match <[Value; 1]>::try_from(responses) {
        Ok([value]) => decode(value),
        Err(v) => Err(RequestError::InvalidResponse(format!("expected 1 response, got {}", v.len()))),
    }
}

pub async fn check_alive(protocol: &RequestProtocol, to: &str, timeout: Duration) -> Result<bool, RequestError> {
    let response: CheckAliveResponse = single_response(protocol, to, &RequestBody::CheckAlive, timeout).await?;
    Ok(response.alive)
}

pub async fn check_for_file(
    protocol: &RequestProtocol,
    to: &str,
    file_key: FileKey,
    timeout: Duration,
) -> Result<CheckForFileResponse, RequestError> {
    single_response(protocol, to, &RequestBody::CheckForFile { file_key }, timeout).await
}

/// Fetch bytes `start..end` of a remote file. `timeout` bounds the gap
/// between messages, not the whole transfer.
pub async fn download_file(
    protocol: &RequestProtocol,
    to: &str,
    file_key: FileKey,
    start: u64,
    end: u64,
    timeout: Duration,
) -> Result<Vec<u8>, RequestError> {
    let body = RequestBody::DownloadFile {
        file_key,
        start_byte: start,
        end_byte: end,
    };
    let mut handle = protocol.make_request(to, encode_body(&body)?, Some(timeout)).await?;
    let mut data = Vec::with_capacity(end.saturating_sub(start) as usize);
    while let Some(event) = handle.next().await {
        match event {
            RequestEvent::Response(value) => {
                let chunk: DownloadChunk = decode(value)?;
                data.extend_from_slice(&chunk.data);
            }
            RequestEvent::Finished => {
                let expected = end.saturating_sub(start);
                if data.len() as u64 != expected {
                    return Err(RequestError::InvalidResponse(format!(
                        "received {} bytes, expected {expected}",
                        data.len()
                    )));
                }
                return Ok(data);
            }
            RequestEvent::Error(e) => return Err(e),
        }
    }
    Err(RequestError::Canceled)
}
