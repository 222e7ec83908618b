//! Frame Codec (component A).
//!
//! One encode and one decode operation for the control-channel wire
//! format. Frames are single UTF-8 JSON text messages; unknown tags are
//! rejected with a typed error rather than silently ignored.

use crate::error::{Error, ErrorKind};
use crate::protocol::Frame;

const KNOWN_TAGS: &[&str] = &[
    "TUNNEL_REGISTER",
    "TUNNEL_REGISTERED",
    "TUNNEL_CLOSE",
    "HTTP_REQUEST",
    "HTTP_RESPONSE",
    "HTTP_RESPONSE_CHUNK",
    "HTTP_RESPONSE_END",
    "HTTP_ERROR",
    "PING",
    "PONG",
    "ERROR",
];

/// Serialize a frame to its wire representation.
pub fn encode(frame: &Frame) -> Result<String, Error> {
    serde_json::to_string(frame).map_err(|e| Error::Codec(e.to_string()))
}

/// Parse a wire message into a [`Frame`].
///
/// Distinguishes a structurally broken message (`INVALID_MESSAGE`) from a
/// well-formed envelope carrying a tag we don't recognize (`UNKNOWN_MESSAGE`)
/// so callers can respond per the control-channel server's dispatch table.
pub fn decode(text: &str) -> Result<Frame, Error> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::new(ErrorKind::InvalidMessage, e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::new(ErrorKind::InvalidMessage, "missing `type` field"))?;

    if !KNOWN_TAGS.contains(&tag) {
        return Err(Error::new(
            ErrorKind::UnknownMessage,
            format!("unrecognized frame tag `{tag}`"),
        ));
    }

    serde_json::from_value(value).map_err(|e| Error::new(ErrorKind::InvalidMessage, e.to_string()))
}
