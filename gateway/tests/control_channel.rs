//! End-to-end control-channel + ingress coverage, playing the agent role
//! with `tokio-tungstenite` the way the teacher's `client/src/main.rs`
//! plays it against the relay, just inverted to drive the gateway under
//! test instead of a real deployment.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use portal_gateway::config::Config;
use portal_shared::codec;
use portal_shared::protocol::{
    BodyEncoding, Frame, HttpRequest, HttpResponse, HttpResponseChunk, HttpResponseEnd, TunnelRegister,
};

fn test_config(port: u16) -> Config {
    Config {
        domain: "portal.local".to_string(),
        port,
        max_stored: 1000,
        retention: Duration::from_secs(1800),
        heartbeat_interval: Duration::from_secs(30),
        request_timeout: Duration::from_secs(2),
        allow_cidrs: Vec::new(),
        deny_cidrs: Vec::new(),
        rate_limit: 600,
        auth_token: None,
    }
}

async fn spawn_gateway(port: u16) {
    spawn_gateway_with(test_config(port)).await;
}

async fn spawn_gateway_with(config: Config) {
    let port = config.port;
    tokio::spawn(portal_gateway::run(config));
    // Poll until the listener accepts rather than sleeping a fixed amount.
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("gateway never started listening on {port}");
}

async fn raw_http_get(port: u16, host: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    (status, body)
}

#[tokio::test]
async fn register_then_serve_a_request_round_trip() {
    let port = 18081;
    spawn_gateway(port).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .expect("agent connects");

    ws.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("roundtrip".to_string()),
            local_port: 4000,
            auth_token: None,
        }))
        .unwrap(),
    ))
    .await
    .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    let frame = codec::decode(ack.to_text().unwrap()).unwrap();
    assert!(matches!(frame, Frame::TunnelRegistered(_)));

    let agent = tokio::spawn(async move {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(Frame::HttpRequest(HttpRequest { request_id, .. })) = codec::decode(&text) {
                        let reply = Frame::HttpResponse(HttpResponse {
                            request_id,
                            status_code: 200,
                            headers: Default::default(),
                            body: Some("pong".to_string()),
                            body_encoding: BodyEncoding::Utf8,
                            streaming: false,
                        });
                        ws.send(WsMessage::Text(codec::encode(&reply).unwrap())).await.unwrap();
                        return ws;
                    }
                }
                Some(Ok(_)) => continue,
                _ => return ws,
            }
        }
    });

    let (status, body) = raw_http_get(port, "roundtrip.portal.local", "/ping").await;
    assert_eq!(status, 200);
    assert!(body.contains("pong"));

    let _ = agent.await;
}

#[tokio::test]
async fn reserved_subdomain_is_rejected() {
    let port = 18082;
    spawn_gateway(port).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    ws.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("admin".to_string()),
            local_port: 4000,
            auth_token: None,
        }))
        .unwrap(),
    ))
    .await
    .unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let frame = codec::decode(reply.to_text().unwrap()).unwrap();
    match frame {
        Frame::Error(payload) => assert_eq!(payload.code, "SUBDOMAIN_TAKEN"),
        other => panic!("expected an ERROR frame, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_subdomain_is_rejected_for_the_second_agent() {
    let port = 18083;
    spawn_gateway(port).await;

    let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    first
        .send(WsMessage::Text(
            codec::encode(&Frame::TunnelRegister(TunnelRegister {
                subdomain: Some("taken".to_string()),
                local_port: 4000,
                auth_token: None,
            }))
            .unwrap(),
        ))
        .await
        .unwrap();
    let ack = first.next().await.unwrap().unwrap();
    assert!(matches!(codec::decode(ack.to_text().unwrap()).unwrap(), Frame::TunnelRegistered(_)));

    let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    second
        .send(WsMessage::Text(
            codec::encode(&Frame::TunnelRegister(TunnelRegister {
                subdomain: Some("taken".to_string()),
                local_port: 4001,
                auth_token: None,
            }))
            .unwrap(),
        ))
        .await
        .unwrap();
    let reply = second.next().await.unwrap().unwrap();
    match codec::decode(reply.to_text().unwrap()).unwrap() {
        Frame::Error(payload) => assert_eq!(payload.code, "SUBDOMAIN_TAKEN"),
        other => panic!("expected an ERROR frame, got {other:?}"),
    }
}

#[tokio::test]
async fn request_to_unknown_subdomain_is_not_found() {
    let port = 18084;
    spawn_gateway(port).await;

    let (status, _) = raw_http_get(port, "nobody-home.portal.local", "/").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn agent_silence_times_out_the_request() {
    let port = 18085;
    spawn_gateway(port).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    ws.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("slowpoke".to_string()),
            local_port: 4000,
            auth_token: None,
        }))
        .unwrap(),
    ))
    .await
    .unwrap();
    let ack = ws.next().await.unwrap().unwrap();
    assert!(matches!(codec::decode(ack.to_text().unwrap()).unwrap(), Frame::TunnelRegistered(_)));

    // The agent never answers HTTP_REQUEST; the forwarder's 2s deadline
    // (set via `test_config`) fires first.
    let (status, _) = raw_http_get(port, "slowpoke.portal.local", "/hang").await;
    assert_eq!(status, 504);
}

#[tokio::test]
async fn streaming_response_chunks_assemble_before_reaching_the_client() {
    let port = 18086;
    spawn_gateway(port).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    ws.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("streamer".to_string()),
            local_port: 4000,
            auth_token: None,
        }))
        .unwrap(),
    ))
    .await
    .unwrap();
    let ack = ws.next().await.unwrap().unwrap();
    assert!(matches!(codec::decode(ack.to_text().unwrap()).unwrap(), Frame::TunnelRegistered(_)));

    let agent = tokio::spawn(async move {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(Frame::HttpRequest(HttpRequest { request_id, .. })) = codec::decode(&text) {
                        let start = Frame::HttpResponse(HttpResponse {
                            request_id: request_id.clone(),
                            status_code: 200,
                            headers: Default::default(),
                            body: None,
                            body_encoding: BodyEncoding::Utf8,
                            streaming: true,
                        });
                        ws.send(WsMessage::Text(codec::encode(&start).unwrap())).await.unwrap();

                        for (index, piece) in ["hel", "lo ", "wor", "ld"].iter().enumerate() {
                            let chunk = Frame::HttpResponseChunk(HttpResponseChunk {
                                request_id: request_id.clone(),
                                index: index as u64,
                                chunk: base64::Engine::encode(
                                    &base64::engine::general_purpose::STANDARD,
                                    piece.as_bytes(),
                                ),
                            });
                            ws.send(WsMessage::Text(codec::encode(&chunk).unwrap())).await.unwrap();
                        }
                        let end = Frame::HttpResponseEnd(HttpResponseEnd { request_id });
                        ws.send(WsMessage::Text(codec::encode(&end).unwrap())).await.unwrap();
                        return ws;
                    }
                }
                Some(Ok(_)) => continue,
                _ => return ws,
            }
        }
    });

    let (status, body) = raw_http_get(port, "streamer.portal.local", "/stream").await;
    assert_eq!(status, 200);
    assert!(body.contains("hello world"));

    let _ = agent.await;
}

#[tokio::test]
async fn wrong_auth_token_is_rejected_and_right_one_is_accepted() {
    let port = 18087;
    let mut config = test_config(port);
    config.auth_token = Some("letmein".to_string());
    spawn_gateway_with(config).await;

    let (mut bad, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    bad.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("secured".to_string()),
            local_port: 4000,
            auth_token: Some("wrong".to_string()),
        }))
        .unwrap(),
    ))
    .await
    .unwrap();
    let reply = bad.next().await.unwrap().unwrap();
    match codec::decode(reply.to_text().unwrap()).unwrap() {
        Frame::Error(payload) => assert_eq!(payload.code, "FORBIDDEN"),
        other => panic!("expected an ERROR frame, got {other:?}"),
    }

    let (mut good, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .unwrap();
    good.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("secured".to_string()),
            local_port: 4000,
            auth_token: Some("letmein".to_string()),
        }))
        .unwrap(),
    ))
    .await
    .unwrap();
    let ack = good.next().await.unwrap().unwrap();
    assert!(matches!(codec::decode(ack.to_text().unwrap()).unwrap(), Frame::TunnelRegistered(_)));
}

#[tokio::test]
async fn tunneled_path_colliding_with_a_management_route_still_reaches_the_agent() {
    let port = 18088;
    spawn_gateway(port).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel"))
        .await
        .expect("agent connects");

    ws.send(WsMessage::Text(
        codec::encode(&Frame::TunnelRegister(TunnelRegister {
            subdomain: Some("collide".to_string()),
            local_port: 4000,
            auth_token: None,
        }))
        .unwrap(),
    ))
    .await
    .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    assert!(matches!(codec::decode(ack.to_text().unwrap()).unwrap(), Frame::TunnelRegistered(_)));

    let agent = tokio::spawn(async move {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(Frame::HttpRequest(HttpRequest { request_id, .. })) = codec::decode(&text) {
                        let reply = Frame::HttpResponse(HttpResponse {
                            request_id,
                            status_code: 200,
                            headers: Default::default(),
                            body: Some("from the agent, not the gateway".to_string()),
                            body_encoding: BodyEncoding::Utf8,
                            streaming: false,
                        });
                        ws.send(WsMessage::Text(codec::encode(&reply).unwrap())).await.unwrap();
                        return ws;
                    }
                }
                Some(Ok(_)) => continue,
                _ => return ws,
            }
        }
    });

    // "/metrics" also names a management route, but on a live tunnel host
    // it must be forwarded to the agent rather than served by the gateway's
    // own metrics handler.
    let (status, body) = raw_http_get(port, "collide.portal.local", "/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("from the agent, not the gateway"));

    let _ = agent.await;
}
