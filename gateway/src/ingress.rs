//! Public Ingress (component F).
//!
//! Grounded on the teacher's `relay/src/main.rs::proxy_handler`: same
//! Host-header-to-subdomain extraction and `axum::body::to_bytes` read,
//! generalized to run the access hooks (I) before lookup and to drive the
//! full forwarder state machine (D) instead of one hardcoded oneshot.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use portal_shared::ErrorKind;

use crate::access::extract_client_ip;
use crate::forwarder::{self, ForwardRequest};
use crate::inspector::{RequestSnapshot, ResponseSnapshot};
use crate::GatewayState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Host header, stripped of any `:port` suffix. Shared with `lib.rs`'s
/// apex/tunnel-host gate so both sides agree on what counts as a host.
pub(crate) fn host_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_string()
}

pub async fn handle(
    State(state): State<GatewayState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let host = host_from_headers(req.headers());

    let Some(subdomain) = candidate_subdomain(&host, &state.config.domain) else {
        return (StatusCode::NOT_FOUND, "not a tunnel host").into_response();
    };

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url_decode_query(q))
        .unwrap_or_default();
    let headers = header_map_to_hashmap(req.headers());

    let client_addr = extract_client_ip(&headers, Some(peer_addr));
    let client_ip = client_addr.map(|ip| ip.to_string());

    if let Some(ip) = client_addr {
        if let Err(e) = state.access.check_ip(ip) {
            warn!(%ip, subdomain, "ip denied by access hook");
            return error_response(e.kind().unwrap_or(ErrorKind::Forbidden), "denied");
        }
    }

    let rate_key = format!("tunnel:{subdomain}");
    let decision = state.access.check_rate(&rate_key, state.config.rate_limit);
    if !decision.allowed {
        let mut response = error_response(ErrorKind::RateLimited, "rate limit exceeded");
        if let Some(retry_after) = decision.retry_after {
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from_str(&retry_after.to_string()).unwrap());
        }
        return response;
    }

    let Some(session) = state.registry.lookup(&subdomain).await else {
        return error_response(ErrorKind::TunnelNotFound, "no tunnel bound to this subdomain");
    };

    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::BAD_REQUEST, "body too large or unreadable").into_response(),
    };

    let ingress_ts_ms = now_millis();
    let request_snapshot = RequestSnapshot {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        headers: headers.clone(),
        body: body_bytes.to_vec(),
        client_ip: client_ip.clone(),
        ingress_ts_ms,
    };
    let request_id = state.inspector.record_request(&session.session_id, &subdomain, request_snapshot).await;

    let outcome = forwarder::forward(
        &session,
        ForwardRequest {
            request_id: request_id.clone(),
            method: &method,
            path: &path,
            headers,
            query,
            body: body_bytes.to_vec(),
            client_ip: client_ip.as_deref(),
            host: &host,
        },
        state.config.request_timeout,
    )
    .await;

    let egress_ts_ms = now_millis();
    match outcome {
        Ok(forwarded) => {
            state
                .inspector
                .record_response(
                    &request_id,
                    ResponseSnapshot {
                        status: forwarded.status,
                        headers: forwarded.headers.clone(),
                        body: forwarded.body.clone(),
                        egress_ts_ms,
                    },
                )
                .await;
            build_response(forwarded.status, forwarded.headers, forwarded.body)
        }
        Err(e) => {
            let kind = e.kind().unwrap_or(ErrorKind::RequestFailed);
            state
                .inspector
                .record_response(
                    &request_id,
                    ResponseSnapshot {
                        status: kind.http_status(),
                        headers: HashMap::new(),
                        body: e.to_string().into_bytes(),
                        egress_ts_ms,
                    },
                )
                .await;
            error_response(kind, &e.to_string())
        }
    }
}

/// Guards the control-channel and management routes: §4.6 routes by Host
/// before path, so a tunneled app that happens to serve a path like
/// `/metrics` or `/health` must still reach the forwarder, not the
/// gateway's own route of the same name. Wrapped around those routes with
/// `route_layer` so it never runs on the (already Host-aware) fallback.
pub async fn require_apex_host(
    State(state): State<GatewayState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let host = host_from_headers(req.headers());
    if candidate_subdomain(&host, &state.config.domain).is_some() {
        return handle(State(state), ConnectInfo(peer_addr), req).await;
    }
    next.run(req).await
}

/// Leftmost label of `host`, case-folded, unless it's a reserved label or
/// the host has no subdomain relative to the configured apex.
pub(crate) fn candidate_subdomain(host: &str, apex: &str) -> Option<String> {
    if host.is_empty() || !host.ends_with(apex) || host == apex {
        return None;
    }
    let without_apex = host.strip_suffix(apex)?.strip_suffix('.')?;
    if without_apex.is_empty() || without_apex.contains('.') {
        // Only a single label is a valid subdomain; deeper labels aren't
        // tunnel hosts under this gateway.
        return None;
    }
    let label = without_apex.to_lowercase();
    if crate::registry::Registry::is_reserved(&label) {
        return None;
    }
    Some(label)
}

fn header_map_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect()
}

fn url_decode_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn build_response(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    if let Some(header_map) = builder.headers_mut() {
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                header_map.insert(name, value);
            }
        }
    }
    builder.body(Body::from(Bytes::from(body))).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response()
    })
}

fn error_response(kind: ErrorKind, message: &str) -> Response {
    (
        StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::BAD_GATEWAY),
        serde_json::json!({ "error": message, "code": kind.code() }).to_string(),
    )
        .into_response()
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
