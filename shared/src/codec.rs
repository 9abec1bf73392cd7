//! JSON envelope codec.
//!
//! Decodes inbound request envelopes, classifies response bodies as text or
//! binary by content type, and enforces the outbound frame ceiling.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::protocol::{RequestEnvelope, ResponseEnvelope, MAX_ENVELOPE_SIZE};
use crate::{Error, Result};

/// Content-type families carried as base64
const BINARY_PREFIXES: &[&str] = &["image/", "audio/", "video/"];
const BINARY_TYPES: &[&str] = &["application/octet-stream", "application/pdf"];

/// How a response body travels inside the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Binary,
}

impl BodyKind {
    pub fn is_binary(self) -> bool {
        self == BodyKind::Binary
    }

    /// Encode raw body bytes for the envelope
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            BodyKind::Binary => STANDARD.encode(bytes),
            BodyKind::Text => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Parse one inbound text frame
pub fn decode(raw: &str) -> Result<RequestEnvelope> {
    serde_json::from_str(raw).map_err(Error::Decode)
}

/// Classify a response body by its content-type header value
pub fn classify(content_type: &str) -> BodyKind {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let binary = BINARY_PREFIXES.iter().any(|p| essence.starts_with(p))
        || BINARY_TYPES.contains(&essence.as_str());

    if binary {
        BodyKind::Binary
    } else {
        BodyKind::Text
    }
}

/// Reject frames above the ceiling; exactly at the ceiling is allowed
pub fn check_size(id: &str, frame: &str) -> Result<()> {
    if frame.len() > MAX_ENVELOPE_SIZE {
        return Err(Error::Oversize {
            id: id.to_string(),
            size: frame.len(),
            limit: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(())
}

/// Serialize a response and run the size check on the result
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<String> {
    let frame = serde_json::to_string(envelope).map_err(Error::Encode)?;
    check_size(&envelope.id, &frame)?;
    Ok(frame)
}
