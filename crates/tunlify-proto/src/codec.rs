//! Codec for encoding/decoding tunnel messages
//!
//! Each channel message carries exactly one JSON object. Decoding peeks at the
//! `type` tag first so an unknown message kind can be told apart from a
//! malformed known one.

use crate::messages::{BodyEncoding, RequestId, TunnelMessage, MESSAGE_KINDS};
use crate::MAX_MESSAGE_SIZE;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Message has no type tag")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A known kind whose fields did not parse. `id` is the correlation id,
    /// when one could still be read from the frame.
    #[error("Invalid {kind} message: {source}")]
    Malformed {
        kind: String,
        id: Option<RequestId>,
        source: serde_json::Error,
    },

    #[error("Invalid body encoding: {0}")]
    InvalidBody(String),
}

/// Outbound `request` frames also carry the id as `requestId` for older
/// clients that read and echo that field
#[derive(Serialize)]
struct WithLegacyId<'a> {
    #[serde(flatten)]
    message: &'a TunnelMessage,
    #[serde(rename = "requestId")]
    request_id: RequestId,
}

fn write_message<W: io::Write>(writer: W, msg: &TunnelMessage) -> Result<(), CodecError> {
    match msg {
        TunnelMessage::Request { id, .. } => serde_json::to_writer(
            writer,
            &WithLegacyId {
                message: msg,
                request_id: *id,
            },
        )?,
        _ => serde_json::to_writer(writer, msg)?,
    }
    Ok(())
}

/// Counts bytes without keeping them
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Size of `msg` once encoded, without building the frame
pub fn encoded_len(msg: &TunnelMessage) -> Result<usize, CodecError> {
    let mut counter = ByteCounter(0);
    write_message(&mut counter, msg)?;
    Ok(counter.0)
}

/// Fail if `msg` cannot be encoded within the frame size limit
pub fn check_encodable(msg: &TunnelMessage) -> Result<(), CodecError> {
    let len = encoded_len(msg)?;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(len));
    }
    Ok(())
}

/// Encode a tunnel message as a JSON text frame
pub fn encode(msg: &TunnelMessage) -> Result<String, CodecError> {
    let mut buf = Vec::new();
    write_message(&mut buf, msg)?;

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(buf.len()));
    }

    // serde_json only emits valid UTF-8
    String::from_utf8(buf).map_err(|e| CodecError::InvalidBody(e.to_string()))
}

/// Decode a tunnel message from a JSON text frame
pub fn decode(text: &str) -> Result<TunnelMessage, CodecError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }

    let value: serde_json::Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(CodecError::MissingType)?
        .to_string();

    if !MESSAGE_KINDS.contains(&kind.as_str()) {
        return Err(CodecError::UnknownType(kind));
    }

    let id = value
        .get("id")
        .or_else(|| value.get("requestId"))
        .and_then(|raw| RequestId::deserialize(raw).ok());

    serde_json::from_value(value).map_err(|source| CodecError::Malformed { kind, id, source })
}

/// Prepare a raw request body for the wire
///
/// UTF-8 bodies travel as-is; anything else is base64-encoded and marked.
/// An empty body is omitted.
pub fn encode_body(body: &[u8]) -> (Option<String>, Option<BodyEncoding>) {
    if body.is_empty() {
        return (None, None);
    }

    match std::str::from_utf8(body) {
        Ok(text) => (Some(text.to_string()), None),
        Err(_) => (Some(BASE64.encode(body)), Some(BodyEncoding::Base64)),
    }
}

/// Recover raw bytes from a body received on the wire
///
/// Non-string JSON values are re-serialized to JSON text.
pub fn decode_body(
    body: Option<serde_json::Value>,
    encoding: Option<BodyEncoding>,
) -> Result<Vec<u8>, CodecError> {
    let Some(body) = body else {
        return Ok(Vec::new());
    };

    match (body, encoding) {
        (serde_json::Value::Null, _) => Ok(Vec::new()),
        (serde_json::Value::String(text), Some(BodyEncoding::Base64)) => BASE64
            .decode(text.as_bytes())
            .map_err(|e| CodecError::InvalidBody(e.to_string())),
        (serde_json::Value::String(text), _) => Ok(text.into_bytes()),
        (_, Some(BodyEncoding::Base64)) => Err(CodecError::InvalidBody(
            "base64 body must be a string".to_string(),
        )),
        (other, _) => Ok(serde_json::to_vec(&other)?),
    }
}
