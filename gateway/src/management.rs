//! Management HTTP surface (§6) — JSON-only, no dashboard.
//!
//! Grounded on the teacher's `relay/src/main.rs` admin routes
//! (`/health`, `/tunnels`, `/metrics`), extended with the inspector and
//! replay endpoints §6 adds that the teacher never had a counterpart for.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::inspector::TrafficFilter;
use crate::replay::Modifications;
use crate::GatewayState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    tunnels: usize,
    uptime_s: u64,
}

pub async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(HealthResponse {
        status: "ok",
        tunnels: stats.tunnel_count,
        uptime_s: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
struct TunnelSummary {
    tunnel_id: String,
    subdomain: String,
    local_port: u16,
    connected_at_ms: i64,
    uptime_ms: u64,
    request_count: usize,
}

pub async fn list_tunnels(State(state): State<GatewayState>) -> impl IntoResponse {
    let infos = state.registry.list().await;
    let traffic = state
        .inspector
        .list(&TrafficFilter {
            limit: usize::MAX,
            ..Default::default()
        })
        .await;

    let now = std::time::Instant::now();
    let summaries: Vec<TunnelSummary> = infos
        .into_iter()
        .map(|info| {
            let request_count = traffic.iter().filter(|t| t.session_id == info.session_id).count();
            TunnelSummary {
                tunnel_id: info.tunnel_id,
                subdomain: info.subdomain,
                local_port: info.local_port,
                connected_at_ms: instant_to_epoch_ms(info.created_at),
                uptime_ms: now.saturating_duration_since(info.created_at).as_millis() as u64,
                request_count,
            }
        })
        .collect();

    Json(summaries)
}

#[derive(Debug, Deserialize)]
pub struct TrafficQuery {
    method: Option<String>,
    status_code: Option<u16>,
    path: Option<String>,
    since: Option<i64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl TryFrom<TrafficQuery> for TrafficFilter {
    type Error = regex::Error;

    fn try_from(q: TrafficQuery) -> Result<Self, Self::Error> {
        let path_regex = q.path.as_deref().map(regex::Regex::new).transpose()?;
        Ok(TrafficFilter {
            method: q.method,
            status_code: q.status_code,
            path_regex,
            since_ms: q.since,
            limit: q.limit.unwrap_or(crate::constants::TRAFFIC_DEFAULT_LIMIT),
            offset: q.offset.unwrap_or(0),
        })
    }
}

pub async fn list_traffic(State(state): State<GatewayState>, Query(query): Query<TrafficQuery>) -> Response {
    let filter = match TrafficFilter::try_from(query) {
        Ok(f) => f,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid path filter: {e}")).into_response(),
    };
    let traffic = state.inspector.list(&filter).await;
    Json(traffic.into_iter().map(traffic_to_json).collect::<Vec<_>>()).into_response()
}

pub async fn get_traffic(State(state): State<GatewayState>, Path(request_id): Path<String>) -> Response {
    match state.inspector.get_by_id(&request_id).await {
        Some(capture) => Json(traffic_to_json(capture)).into_response(),
        None => (StatusCode::NOT_FOUND, "no capture with that request id").into_response(),
    }
}

pub async fn purge_traffic(State(state): State<GatewayState>) -> impl IntoResponse {
    state.inspector.purge().await;
    StatusCode::NO_CONTENT
}

fn traffic_to_json(capture: crate::inspector::CapturedTraffic) -> serde_json::Value {
    serde_json::json!({
        "request_id": capture.request_id,
        "session_id": capture.session_id,
        "subdomain": capture.subdomain,
        "request": {
            "method": capture.request.method,
            "path": capture.request.path,
            "query": capture.request.query,
            "headers": capture.request.headers,
            "client_ip": capture.request.client_ip,
            "ingress_ts_ms": capture.request.ingress_ts_ms,
            "body_bytes": capture.request.body.len(),
        },
        "response": capture.response.as_ref().map(|r| serde_json::json!({
            "status": r.status,
            "headers": r.headers,
            "egress_ts_ms": r.egress_ts_ms,
            "body_bytes": r.body.len(),
        })),
        "response_time_ms": capture.response_time_ms,
    })
}

pub async fn replay(
    State(state): State<GatewayState>,
    Path(request_id): Path<String>,
    Json(modifications): Json<Modifications>,
) -> Response {
    match state.replay.replay(&request_id, modifications).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_to_response(e),
    }
}

pub async fn replay_with_diff(
    State(state): State<GatewayState>,
    Path(request_id): Path<String>,
    Json(modifications): Json<Modifications>,
) -> Response {
    match state.replay.replay_with_diff(&request_id, modifications).await {
        Ok((record, diff)) => Json(serde_json::json!({ "record": record, "diff": diff })).into_response(),
        Err(e) => error_to_response(e),
    }
}

pub async fn metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.inspector.snapshot().await)
}

pub async fn metrics_prometheus(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.inspector.prometheus().await,
    )
}

fn error_to_response(e: portal_shared::Error) -> Response {
    let kind = e.kind().unwrap_or(portal_shared::ErrorKind::RequestFailed);
    (
        StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::BAD_GATEWAY),
        Json(serde_json::json!({ "error": e.to_string(), "code": kind.code() })),
    )
        .into_response()
}

fn instant_to_epoch_ms(instant: std::time::Instant) -> i64 {
    let now_instant = std::time::Instant::now();
    let now_epoch_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    now_epoch_ms - now_instant.saturating_duration_since(instant).as_millis() as i64
}
