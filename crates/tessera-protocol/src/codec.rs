//! JSON encoding of session frames.
//!
//! Both transports already deliver whole messages (a reliable UDP message or
//! a WebSocket binary frame), so one message carries exactly one serialized
//! `SignedFrame` with no further framing.

use bytes::Bytes;

use crate::messages::SignedFrame;
use crate::ProtocolError;

/// Largest serialized frame either side will produce or accept. A download
/// chunk plus its envelope is far smaller.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Upper bound on the JSON envelope that carries one frame over UDP: the
/// base64 payload plus connection id, message id and field names.
pub const MAX_ENVELOPE_SIZE: usize = MAX_FRAME_SIZE.div_ceil(3) * 4 + 1024;

pub fn encode_frame(frame: &SignedFrame) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Bytes::from(payload))
}

/// Decode one message's worth of bytes. Oversized input is refused before
/// parsing.
pub fn decode_frame(bytes: &[u8]) -> Result<SignedFrame, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}
