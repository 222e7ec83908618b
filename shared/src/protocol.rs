//! Control-channel wire protocol.
//!
//! A frame is a tagged envelope `{ type, payload }` carried as a single
//! UTF-8 text message. Binary bodies are base64-encoded inside the payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Max number of bytes accepted for a single text frame.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// How the `body` field of a request/response payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Base64,
    Utf8,
    None,
}

impl Default for BodyEncoding {
    fn default() -> Self {
        BodyEncoding::Base64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelRegister {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRegistered {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClose {
    pub tunnel_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseChunk {
    pub request_id: String,
    pub index: u64,
    pub chunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseEnd {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpError {
    pub request_id: String,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: String,
}

/// A tagged control-channel message. `tag()` / `encode()` / `decode()` on
/// this type are the codec's one decode and one encode operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    #[serde(rename = "TUNNEL_REGISTER")]
    TunnelRegister(TunnelRegister),
    #[serde(rename = "TUNNEL_REGISTERED")]
    TunnelRegistered(TunnelRegistered),
    #[serde(rename = "TUNNEL_CLOSE")]
    TunnelClose(TunnelClose),
    #[serde(rename = "HTTP_REQUEST")]
    HttpRequest(HttpRequest),
    #[serde(rename = "HTTP_RESPONSE")]
    HttpResponse(HttpResponse),
    #[serde(rename = "HTTP_RESPONSE_CHUNK")]
    HttpResponseChunk(HttpResponseChunk),
    #[serde(rename = "HTTP_RESPONSE_END")]
    HttpResponseEnd(HttpResponseEnd),
    #[serde(rename = "HTTP_ERROR")]
    HttpError(HttpError),
    #[serde(rename = "PING")]
    Ping(Heartbeat),
    #[serde(rename = "PONG")]
    Pong(Heartbeat),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
}

impl Frame {
    /// Stable tag string as it appears on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::TunnelRegister(_) => "TUNNEL_REGISTER",
            Frame::TunnelRegistered(_) => "TUNNEL_REGISTERED",
            Frame::TunnelClose(_) => "TUNNEL_CLOSE",
            Frame::HttpRequest(_) => "HTTP_REQUEST",
            Frame::HttpResponse(_) => "HTTP_RESPONSE",
            Frame::HttpResponseChunk(_) => "HTTP_RESPONSE_CHUNK",
            Frame::HttpResponseEnd(_) => "HTTP_RESPONSE_END",
            Frame::HttpError(_) => "HTTP_ERROR",
            Frame::Ping(_) => "PING",
            Frame::Pong(_) => "PONG",
            Frame::Error(_) => "ERROR",
        }
    }

    pub fn error(kind: crate::error::ErrorKind, message: impl Into<String>) -> Self {
        Frame::Error(ErrorPayload {
            error: message.into(),
            code: kind.code().to_string(),
        })
    }
}
