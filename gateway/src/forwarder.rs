//! Request Forwarder (component D).
//!
//! Drives one request through `AwaitingWrite -> AwaitingResponse ->
//! Complete/Errored/TimedOut` on top of `Session`'s pending-table and
//! stream-assembly machinery. Grounded on the teacher's
//! `relay/src/main.rs::forward_request`, which did the same
//! request/reply-over-websocket dance without streaming or a timeout;
//! both are added here per §4.4.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;

use portal_shared::protocol::{BodyEncoding, Frame, HttpRequest};
use portal_shared::{Error, ErrorKind, Result};

use crate::headers::{inject_proxy_headers, strip_hop_by_hop};
use crate::session::{ForwardOutcome, Session};

#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct ForwardRequest<'a> {
    pub request_id: String,
    pub method: &'a str,
    pub path: &'a str,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
    pub client_ip: Option<&'a str>,
    pub host: &'a str,
}

/// Forward one HTTP request across an agent's session and wait for its
/// response, or `timeout`.
pub async fn forward(session: &Session, req: ForwardRequest<'_>, timeout: Duration) -> Result<ForwardedResponse> {
    if !session.is_alive() {
        return Err(ErrorKind::TunnelUnavailable.into());
    }

    let mut headers = req.headers;
    strip_hop_by_hop(&mut headers);
    inject_proxy_headers(&mut headers, req.client_ip, req.host);

    let body = encode_body(&req.body);
    let frame = Frame::HttpRequest(HttpRequest {
        request_id: req.request_id.clone(),
        method: req.method.to_string(),
        path: req.path.to_string(),
        headers,
        query: req.query,
        body,
        body_encoding: BodyEncoding::Base64,
    });

    // Register before sending: a response that races ahead of our own
    // `send` returning still finds a waiter (§5 ordering contract).
    let rx = session.register_pending(&req.request_id);
    if let Err(e) = session.send(&frame).await {
        session.cancel_pending(&req.request_id);
        return Err(e);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome_to_response(outcome),
        Ok(Err(_)) => Err(Error::new(ErrorKind::ConnectionClosed, "pending request dropped without a response")),
        Err(_elapsed) => {
            session.cancel_pending(&req.request_id);
            warn!(request_id = %req.request_id, timeout_secs = timeout.as_secs(), "request timed out");
            Err(ErrorKind::RequestTimeout.into())
        }
    }
}

/// An agent `HTTP_ERROR` still carries the status the public boundary
/// should answer with (§4.4 step 7: `CONNECTION_REFUSED`→503,
/// `TIMEOUT`→504, or an explicit `status_code` override) — it surfaces as
/// a response, not a forwarder-level `Err`, so that status reaches the
/// caller instead of being folded to a blanket 502.
fn outcome_to_response(outcome: ForwardOutcome) -> Result<ForwardedResponse> {
    match outcome {
        ForwardOutcome::Response { status, headers, body } => Ok(ForwardedResponse { status, headers, body }),
        ForwardOutcome::Error { status, code, message } => Ok(ForwardedResponse {
            status,
            headers: HashMap::new(),
            body: format!("agent reported {code}: {message}").into_bytes(),
        }),
        ForwardOutcome::SessionClosed => Err(ErrorKind::SessionClosed.into()),
    }
}

fn encode_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(BASE64.encode(body))
    }
}

/// Decode a wire body field per its declared encoding. Used by the
/// control channel when it turns `HTTP_RESPONSE`/`_CHUNK` frames back
/// into bytes for `Session::deliver`.
pub fn decode_body(body: &Option<String>, encoding: BodyEncoding) -> Result<Vec<u8>> {
    let Some(raw) = body else { return Ok(Vec::new()) };
    match encoding {
        BodyEncoding::None => Ok(Vec::new()),
        BodyEncoding::Utf8 => Ok(raw.as_bytes().to_vec()),
        BodyEncoding::Base64 => BASE64
            .decode(raw)
            .map_err(|e| Error::new(ErrorKind::InvalidMessage, format!("invalid base64 body: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_session() -> (Session, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Session::new("s1".into(), "app".into(), 3000, tx), rx)
    }

    #[tokio::test]
    async fn forwards_and_resolves_unary_response() {
        let (session, mut rx) = make_session();
        let session_for_agent = session.clone();
        let agent = tokio::spawn(async move {
            let _wire = rx.recv().await.unwrap();
            let pending_id = "r1".to_string();
            session_for_agent
                .deliver(
                    &pending_id,
                    crate::session::InboundOutcome::Unary {
                        status: 200,
                        headers: HashMap::new(),
                        body: b"ok".to_vec(),
                    },
                )
                .await;
        });

        let result = forward(
            &session,
            ForwardRequest {
                request_id: "r1".into(),
                method: "GET",
                path: "/",
                headers: HashMap::new(),
                query: HashMap::new(),
                body: Vec::new(),
                client_ip: Some("1.2.3.4"),
                host: "app.portal.local",
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        agent.await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.body, b"ok");
    }

    #[tokio::test]
    async fn dead_session_fails_fast() {
        let (session, _rx) = make_session();
        session.close().await;
        let err = forward(
            &session,
            ForwardRequest {
                request_id: "r2".into(),
                method: "GET",
                path: "/",
                headers: HashMap::new(),
                query: HashMap::new(),
                body: Vec::new(),
                client_ip: None,
                host: "app.portal.local",
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TunnelUnavailable));
    }

    #[tokio::test]
    async fn silence_times_out_before_the_deadline_elapses() {
        let (session, _rx) = make_session();
        let err = forward(
            &session,
            ForwardRequest {
                request_id: "r3".into(),
                method: "GET",
                path: "/",
                headers: HashMap::new(),
                query: HashMap::new(),
                body: Vec::new(),
                client_ip: None,
                host: "app.portal.local",
            },
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RequestTimeout));
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn body_roundtrips_through_base64() {
        let encoded = encode_body(b"hello").unwrap();
        let decoded = decode_body(&Some(encoded), BodyEncoding::Base64).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn empty_body_encodes_to_none() {
        assert!(encode_body(b"").is_none());
        assert_eq!(decode_body(&None, BodyEncoding::Base64).unwrap(), Vec::<u8>::new());
    }
}
