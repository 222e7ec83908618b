//! Control-Channel Server (component E).
//!
//! Grounded on the teacher's `relay/src/main.rs::handle_socket`: same
//! upgrade-then-register-then-select! loop shape (reader / outbound queue
//! / ping ticker), generalized from the teacher's single hardcoded
//! request/response exchange to the full per-tag dispatch table §4.5
//! names, and from silent suffix-on-conflict to a typed `TUNNEL_REGISTERED`
//! / `ERROR` reply.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use portal_shared::codec;
use portal_shared::protocol::{
    ErrorPayload, Frame, Heartbeat, HttpError, HttpResponse, HttpResponseChunk, HttpResponseEnd, TunnelRegistered,
};
use portal_shared::ErrorKind;

use crate::forwarder;
use crate::registry::RegisterRequest;
use crate::session::{InboundOutcome, Session};
use crate::GatewayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer_addr))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, peer_addr: SocketAddr) {
    let auth_key = peer_addr.ip().to_string();
    if let Err(e) = state.access.check_not_blocked(&auth_key) {
        warn!(peer = %peer_addr, "rejecting control connection: {e}");
        let _ = socket
            .send(Message::Text(codec::encode(&Frame::error(ErrorKind::Forbidden, e.to_string())).unwrap_or_default().into()))
            .await;
        return;
    }

    let register = match wait_for_registration(&mut socket).await {
        Some(frame) => frame,
        None => return,
    };

    if let Some(expected) = &state.config.auth_token {
        if register.auth_token.as_deref() != Some(expected.as_str()) {
            state.access.record_failed_auth(&auth_key);
            warn!(peer = %peer_addr, "rejecting control connection: bad auth token");
            let _ = socket
                .send(Message::Text(
                    codec::encode(&Frame::error(ErrorKind::Forbidden, "invalid auth token")).unwrap_or_default().into(),
                ))
                .await;
            return;
        }
        state.access.clear_failed_auth(&auth_key);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(128);
    let session_id = crate::ids::session_id();
    // The session's own `subdomain` field is set to the requested value, if
    // any; the registry's `TunnelInfo` is authoritative once registration
    // resolves a generated or conflicting one.
    let session = Session::new(
        session_id.clone(),
        register.subdomain.clone().unwrap_or_default(),
        register.local_port,
        outbound_tx,
    );

    let tunnel_info = match state
        .registry
        .register(RegisterRequest {
            requested_subdomain: register.subdomain,
            local_port: register.local_port,
            session: session.clone(),
        })
        .await
    {
        Ok(info) => info,
        Err(err) => {
            let kind = err.kind().unwrap_or(ErrorKind::RequestFailed);
            let _ = socket
                .send(Message::Text(codec::encode(&Frame::error(kind, err.to_string())).unwrap_or_default().into()))
                .await;
            return;
        }
    };

    let public_url = format!("http://{}.{}:{}", tunnel_info.subdomain, state.config.domain, state.config.port);
    let reply = Frame::TunnelRegistered(TunnelRegistered {
        tunnel_id: tunnel_info.tunnel_id.clone(),
        subdomain: tunnel_info.subdomain.clone(),
        public_url: public_url.clone(),
    });
    let Ok(reply_text) = codec::encode(&reply) else { return };
    if socket.send(Message::Text(reply_text.into())).await.is_err() {
        state.registry.close(&tunnel_info.tunnel_id, "registration ack failed").await;
        return;
    }
    info!(subdomain = %tunnel_info.subdomain, peer = %peer_addr, url = %public_url, "tunnel active");

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.touch();
                        handle_inbound_frame(&state, &session, &tunnel_info.tunnel_id, &text, &mut sender).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        session.touch();
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => session.touch(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "control channel read error");
                        break;
                    }
                }
            }
            Some(text) = outbound_rx.recv() => {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if session.idle_for() > state.config.heartbeat_interval * 2 {
                    warn!(subdomain = %tunnel_info.subdomain, "missed two heartbeats, terminating session");
                    break;
                }
                let ping = Frame::Ping(Heartbeat { timestamp: now_millis() });
                if let Ok(text) = codec::encode(&ping) {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.registry.close_by_session(&session_id, "Client disconnected").await;
    info!(subdomain = %tunnel_info.subdomain, "tunnel closed");
}

struct PendingRegistration {
    subdomain: Option<String>,
    local_port: u16,
    auth_token: Option<String>,
}

async fn wait_for_registration(socket: &mut WebSocket) -> Option<PendingRegistration> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                Ok(Frame::TunnelRegister(reg)) => {
                    return Some(PendingRegistration {
                        subdomain: reg.subdomain,
                        local_port: reg.local_port,
                        auth_token: reg.auth_token,
                    })
                }
                Ok(_) => {
                    let _ = socket
                        .send(Message::Text(
                            codec::encode(&Frame::error(ErrorKind::InvalidMessage, "expected TUNNEL_REGISTER first"))
                                .unwrap_or_default()
                                .into(),
                        ))
                        .await;
                    return None;
                }
                Err(e) => {
                    let _ = socket
                        .send(Message::Text(codec::encode(&Frame::error(e.kind().unwrap_or(ErrorKind::InvalidMessage), e.to_string())).unwrap_or_default().into()))
                        .await;
                    return None;
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        }
    }
}

async fn handle_inbound_frame(
    state: &GatewayState,
    session: &Session,
    tunnel_id: &str,
    text: &str,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) {
    let frame = match codec::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            let reply = Frame::error(e.kind().unwrap_or(ErrorKind::UnknownMessage), e.to_string());
            if let Ok(text) = codec::encode(&reply) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            return;
        }
    };

    match frame {
        Frame::HttpResponse(HttpResponse {
            request_id,
            status_code,
            headers,
            body,
            body_encoding,
            streaming,
        }) => {
            if streaming {
                session
                    .deliver(&request_id, InboundOutcome::StreamStart { status: status_code, headers })
                    .await;
            } else {
                let body = forwarder::decode_body(&body, body_encoding).unwrap_or_default();
                session
                    .deliver(&request_id, InboundOutcome::Unary { status: status_code, headers, body })
                    .await;
            }
        }
        Frame::HttpResponseChunk(HttpResponseChunk { request_id, index, chunk }) => {
            let chunk = forwarder::decode_body(&Some(chunk), portal_shared::protocol::BodyEncoding::Base64).unwrap_or_default();
            session.deliver(&request_id, InboundOutcome::StreamChunk { index, chunk }).await;
        }
        Frame::HttpResponseEnd(HttpResponseEnd { request_id }) => {
            session.deliver(&request_id, InboundOutcome::StreamEnd).await;
        }
        Frame::HttpError(HttpError { request_id, error, code, status_code }) => {
            session
                .deliver(
                    &request_id,
                    InboundOutcome::Error {
                        status: status_code.unwrap_or_else(|| status_for_agent_code(&code)),
                        code,
                        message: error,
                    },
                )
                .await;
        }
        Frame::Ping(hb) => {
            if let Ok(text) = codec::encode(&Frame::Pong(hb)) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
        }
        Frame::Pong(_) => {}
        Frame::TunnelClose(close) => {
            state.registry.close(&close.tunnel_id, &close.reason).await;
        }
        Frame::TunnelRegister(_) => {
            warn!(tunnel_id, "ignoring TUNNEL_REGISTER on an already-registered connection");
        }
        Frame::TunnelRegistered(_) | Frame::HttpRequest(_) => {
            warn!(tunnel_id, tag = frame.tag(), "unexpected gateway-direction frame from agent, ignoring");
        }
        Frame::Error(ErrorPayload { error, code }) => {
            warn!(tunnel_id, code, error, "agent reported an error");
        }
    }
}

fn status_for_agent_code(code: &str) -> u16 {
    match code {
        "CONNECTION_REFUSED" => 503,
        "TIMEOUT" => 504,
        _ => 502,
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
