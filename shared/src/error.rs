//! Error types shared between the gateway's subsystems.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error identifiers surfaced over the wire and the management API.
///
/// These map onto the HTTP status used at the public boundary and the
/// `code` field of `ERROR` / `HTTP_ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("TUNNEL_NOT_FOUND")]
    TunnelNotFound,
    #[error("CONNECTION_CLOSED")]
    ConnectionClosed,
    #[error("REQUEST_TIMEOUT")]
    RequestTimeout,
    #[error("REQUEST_FAILED")]
    RequestFailed,
    #[error("SUBDOMAIN_TAKEN")]
    SubdomainTaken,
    #[error("SUBDOMAIN_INVALID")]
    SubdomainInvalid,
    #[error("SUBDOMAIN_GENERATION_FAILED")]
    SubdomainGenerationFailed,
    #[error("INVALID_MESSAGE")]
    InvalidMessage,
    #[error("UNKNOWN_MESSAGE")]
    UnknownMessage,
    #[error("RATE_LIMITED")]
    RateLimited,
    #[error("FORBIDDEN")]
    Forbidden,
    #[error("REQUEST_NOT_FOUND")]
    RequestNotFound,
    #[error("TUNNEL_UNAVAILABLE")]
    TunnelUnavailable,
    #[error("SESSION_CLOSED")]
    SessionClosed,
}

impl ErrorKind {
    /// Stable identifier used in `{ error, code }` payloads.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::TunnelNotFound => "TUNNEL_NOT_FOUND",
            ErrorKind::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorKind::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorKind::RequestFailed => "REQUEST_FAILED",
            ErrorKind::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorKind::SubdomainInvalid => "SUBDOMAIN_INVALID",
            ErrorKind::SubdomainGenerationFailed => "SUBDOMAIN_GENERATION_FAILED",
            ErrorKind::InvalidMessage => "INVALID_MESSAGE",
            ErrorKind::UnknownMessage => "UNKNOWN_MESSAGE",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::RequestNotFound => "REQUEST_NOT_FOUND",
            ErrorKind::TunnelUnavailable => "TUNNEL_UNAVAILABLE",
            ErrorKind::SessionClosed => "SESSION_CLOSED",
        }
    }

    /// HTTP status to surface at the public ingress boundary.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::TunnelNotFound => 404,
            ErrorKind::ConnectionClosed => 502,
            ErrorKind::RequestTimeout => 504,
            ErrorKind::RequestFailed => 502,
            ErrorKind::RateLimited => 429,
            ErrorKind::Forbidden => 403,
            ErrorKind::RequestNotFound => 404,
            ErrorKind::SessionClosed => 502,
            ErrorKind::SubdomainTaken
            | ErrorKind::SubdomainInvalid
            | ErrorKind::SubdomainGenerationFailed
            | ErrorKind::InvalidMessage
            | ErrorKind::UnknownMessage
            | ErrorKind::TunnelUnavailable => 400,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind}: {message}")]
    Kind { kind: ErrorKind, message: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Kind {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Kind { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::Kind {
            kind,
            message: kind.code().to_string(),
        }
    }
}
