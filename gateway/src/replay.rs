//! Replay Engine (component H).
//!
//! No teacher counterpart — `relay/` never re-drives a captured request.
//! Grounded on the same session/forwarder plumbing `forwarder.rs` already
//! uses, with the diff computation built fresh from §4.8's field-by-field
//! rules. The "direct" loopback fallback §9 calls out as an open question
//! is intentionally not implemented: every record here has
//! `replayed_via: "tunnel"`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use portal_shared::{Error, ErrorKind, Result};

use crate::constants::REPLAY_HISTORY_CAP;
use crate::forwarder::{self, ForwardRequest};
use crate::ids;
use crate::inspector::Inspector;
use crate::registry::Registry;

const STRIPPED_ON_REPLAY: &[&str] = &["content-length", "host", "connection"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Modifications {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub query: Option<HashMap<String, String>>,
    /// Raw replacement body. Serialized as UTF-8 text for a JSON string
    /// value, as JSON bytes for anything else (§4.8 step 2).
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyntheticRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayRecord {
    pub replay_id: String,
    pub original_request_id: String,
    pub replayed_at_ms: i64,
    pub subdomain: String,
    pub session_id: String,
    pub request: SyntheticRequest,
    pub modifications: serde_json::Value,
    pub response: Option<ReplayResponse>,
    pub duration_ms: u64,
    pub success: bool,
    pub replayed_via: &'static str,
}

pub struct ReplayEngine {
    registry: Arc<Registry>,
    inspector: Arc<Inspector>,
    history: Mutex<std::collections::VecDeque<ReplayRecord>>,
    request_timeout: std::time::Duration,
}

impl ReplayEngine {
    pub fn new(registry: Arc<Registry>, inspector: Arc<Inspector>, request_timeout: std::time::Duration) -> Self {
        Self {
            registry,
            inspector,
            history: Mutex::new(std::collections::VecDeque::new()),
            request_timeout,
        }
    }

    pub async fn replay(&self, request_id: &str, modifications: Modifications) -> Result<ReplayRecord> {
        let original = self
            .inspector
            .get_by_id(request_id)
            .await
            .ok_or_else(|| Error::new(ErrorKind::RequestNotFound, format!("no capture for {request_id}")))?;

        let synthetic = build_synthetic_request(&original.request, &modifications);

        let session = self
            .registry
            .lookup(&original.subdomain)
            .await
            .ok_or_else(|| Error::from(ErrorKind::TunnelUnavailable))?;

        let start = Instant::now();
        let replay_id = ids::replay_id();
        let forwarded = forwarder::forward(
            &session,
            ForwardRequest {
                request_id: ids::request_id(),
                method: &synthetic.method,
                path: &synthetic.path,
                headers: synthetic.headers.clone(),
                query: synthetic.query.clone(),
                body: synthetic.body.clone(),
                client_ip: None,
                host: &format!("{}.replay", original.subdomain),
            },
            self.request_timeout,
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (response, success) = match forwarded {
            Ok(resp) => (
                Some(ReplayResponse {
                    status: resp.status,
                    headers: resp.headers,
                    body: resp.body,
                    response_time_ms: duration_ms,
                }),
                true,
            ),
            Err(_) => (None, false),
        };

        let record = ReplayRecord {
            replay_id,
            original_request_id: request_id.to_string(),
            replayed_at_ms: now_millis(),
            subdomain: original.subdomain.clone(),
            session_id: original.session_id.clone(),
            request: synthetic,
            modifications: modifications_to_json(&modifications),
            response,
            duration_ms,
            success,
            replayed_via: "tunnel",
        };

        let mut history = self.history.lock().await;
        history.push_back(record.clone());
        while history.len() > REPLAY_HISTORY_CAP {
            history.pop_front();
        }
        drop(history);

        Ok(record)
    }

    pub async fn replay_with_diff(&self, request_id: &str, modifications: Modifications) -> Result<(ReplayRecord, Diff)> {
        let original = self
            .inspector
            .get_by_id(request_id)
            .await
            .ok_or_else(|| Error::new(ErrorKind::RequestNotFound, format!("no capture for {request_id}")))?;
        let record = self.replay(request_id, modifications).await?;

        let original_response = original.response.as_ref();
        let diff = Diff::compute(
            original_response.map(|r| r.status),
            record.response.as_ref().map(|r| r.status),
            original.response_time_ms,
            record.response.as_ref().map(|r| r.response_time_ms),
            original_response.map(|r| &r.headers),
            record.response.as_ref().map(|r| &r.headers),
            original_response.map(|r| r.body.as_slice()),
            record.response.as_ref().map(|r| r.body.as_slice()),
        );

        Ok((record, diff))
    }

    pub async fn history(&self) -> Vec<ReplayRecord> {
        self.history.lock().await.iter().cloned().collect()
    }
}

fn build_synthetic_request(original: &crate::inspector::RequestSnapshot, modifications: &Modifications) -> SyntheticRequest {
    let method = modifications
        .method
        .as_ref()
        .map(|m| m.to_uppercase())
        .unwrap_or_else(|| original.method.clone());
    let path = modifications.path.clone().unwrap_or_else(|| original.path.clone());

    let mut headers = original.headers.clone();
    if let Some(overrides) = &modifications.headers {
        for (k, v) in overrides {
            headers.insert(k.clone(), v.clone());
        }
    }
    for stripped in STRIPPED_ON_REPLAY {
        headers.retain(|k, _| !k.eq_ignore_ascii_case(stripped));
    }

    let mut query = original.query.clone();
    if let Some(overrides) = &modifications.query {
        for (k, v) in overrides {
            query.insert(k.clone(), v.clone());
        }
    }

    let body = match &modifications.body {
        Some(serde_json::Value::String(s)) => s.clone().into_bytes(),
        Some(other) => serde_json::to_vec(other).unwrap_or_default(),
        None => original.body.clone(),
    };

    SyntheticRequest {
        method,
        path,
        headers,
        query,
        body,
    }
}

fn modifications_to_json(modifications: &Modifications) -> serde_json::Value {
    serde_json::json!({
        "method": modifications.method,
        "path": modifications.path,
        "headers": modifications.headers,
        "query": modifications.query,
        "body": modifications.body,
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusDiff {
    pub original: Option<u16>,
    pub replay: Option<u16>,
    pub changed: bool,
    pub severity: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingDiff {
    pub delta_ms: i64,
    pub percent_change: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderModification {
    pub original: String,
    pub replay: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HeadersDiff {
    pub added: HashMap<String, String>,
    pub removed: HashMap<String, String>,
    pub modified: HashMap<String, HeaderModification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonModification {
    pub original: serde_json::Value,
    pub replay: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyDiff {
    pub additions: HashMap<String, serde_json::Value>,
    pub removals: HashMap<String, serde_json::Value>,
    pub modifications: HashMap<String, JsonModification>,
    pub original_length: Option<usize>,
    pub replay_length: Option<usize>,
    pub length_delta: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diff {
    pub status: StatusDiff,
    pub timing: TimingDiff,
    pub headers: HeadersDiff,
    pub body: BodyDiff,
    pub total_changes: usize,
}

impl Diff {
    #[allow(clippy::too_many_arguments)]
    fn compute(
        original_status: Option<u16>,
        replay_status: Option<u16>,
        original_ms: Option<u64>,
        replay_ms: Option<u64>,
        original_headers: Option<&HashMap<String, String>>,
        replay_headers: Option<&HashMap<String, String>>,
        original_body: Option<&[u8]>,
        replay_body: Option<&[u8]>,
    ) -> Self {
        let status = status_diff(original_status, replay_status);
        let timing = timing_diff(original_ms, replay_ms);
        let headers = headers_diff(original_headers, replay_headers);
        let body = body_diff(original_body, replay_body);

        let total_changes = status.changed as usize
            + timing.significant as usize
            + headers.added.len()
            + headers.removed.len()
            + headers.modified.len()
            + body.additions.len()
            + body.removals.len()
            + body.modifications.len()
            + body.length_delta.filter(|d| *d != 0).map_or(0, |_| 1);

        Diff {
            status,
            timing,
            headers,
            body,
            total_changes,
        }
    }
}

fn status_diff(original: Option<u16>, replay: Option<u16>) -> StatusDiff {
    let changed = original != replay;
    let severity = match (original, replay) {
        (Some(o), Some(r)) if o / 100 != r / 100 => "critical",
        (Some(o), Some(r)) if o != r => "warning",
        _ if changed => "critical",
        _ => "none",
    };
    StatusDiff {
        original,
        replay,
        changed,
        severity,
    }
}

fn timing_diff(original_ms: Option<u64>, replay_ms: Option<u64>) -> TimingDiff {
    let original = original_ms.unwrap_or(0) as i64;
    let replay = replay_ms.unwrap_or(0) as i64;
    let delta_ms = replay - original;
    let percent_change = if original == 0 {
        0.0
    } else {
        (delta_ms as f64 / original as f64) * 100.0
    };
    TimingDiff {
        delta_ms,
        percent_change,
        significant: percent_change.abs() > 20.0,
    }
}

fn headers_diff(original: Option<&HashMap<String, String>>, replay: Option<&HashMap<String, String>>) -> HeadersDiff {
    let empty = HashMap::new();
    let original = original.unwrap_or(&empty);
    let replay = replay.unwrap_or(&empty);

    let mut diff = HeadersDiff::default();
    let keys: std::collections::HashSet<&String> = original.keys().chain(replay.keys()).collect();
    for key in keys {
        match (original.get(key), replay.get(key)) {
            (None, Some(v)) => {
                diff.added.insert(key.clone(), v.clone());
            }
            (Some(v), None) => {
                diff.removed.insert(key.clone(), v.clone());
            }
            (Some(o), Some(r)) if o != r => {
                diff.modified.insert(
                    key.clone(),
                    HeaderModification {
                        original: o.clone(),
                        replay: r.clone(),
                    },
                );
            }
            _ => {}
        }
    }
    diff
}

fn body_diff(original: Option<&[u8]>, replay: Option<&[u8]>) -> BodyDiff {
    let original = original.unwrap_or(&[]);
    let replay = replay.unwrap_or(&[]);

    let original_json = serde_json::from_slice::<serde_json::Value>(original);
    let replay_json = serde_json::from_slice::<serde_json::Value>(replay);

    if let (Ok(o), Ok(r)) = (original_json, replay_json) {
        let mut diff = BodyDiff::default();
        diff_json_values(&o, &r, "", &mut diff);
        diff
    } else {
        BodyDiff {
            original_length: Some(original.len()),
            replay_length: Some(replay.len()),
            length_delta: Some(replay.len() as i64 - original.len() as i64),
            ..Default::default()
        }
    }
}

/// Recursive key-path diff of two JSON values. Objects are walked key by
/// key with dotted paths; arrays and scalars are compared by value, with a
/// mismatch recorded as a single modification at the current path.
fn diff_json_values(original: &serde_json::Value, replay: &serde_json::Value, path: &str, diff: &mut BodyDiff) {
    match (original, replay) {
        (serde_json::Value::Object(o), serde_json::Value::Object(r)) => {
            let keys: std::collections::HashSet<&String> = o.keys().chain(r.keys()).collect();
            for key in keys {
                let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                match (o.get(key), r.get(key)) {
                    (None, Some(v)) => {
                        diff.additions.insert(child_path, v.clone());
                    }
                    (Some(v), None) => {
                        diff.removals.insert(child_path, v.clone());
                    }
                    (Some(ov), Some(rv)) => diff_json_values(ov, rv, &child_path, diff),
                    (None, None) => unreachable!(),
                }
            }
        }
        (o, r) if o != r => {
            diff.modifications.insert(
                path.to_string(),
                JsonModification {
                    original: o.clone(),
                    replay: r.clone(),
                },
            );
        }
        _ => {}
    }
}
