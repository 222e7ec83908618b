//! Traffic Inspector (component G).
//!
//! Ring-buffered capture of (request, response) pairs plus rolling-window
//! derived metrics, computed on demand rather than cached. Grounded on the
//! teacher's `relay/src/metrics.rs::Metrics`/`LatencyHistogram` for the
//! counter/percentile shape and its `to_prometheus()` exposition format,
//! generalized from a fixed-size microsecond ring to the genuine time
//! windows and per-request capture store §3/§4.7 require.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::constants::{
    LATENCY_WINDOW, RETENTION, SHORT_WINDOW, TIME_SERIES_BUCKET, TIME_SERIES_MAX_BUCKETS,
    TOP_PATHS_DEFAULT_K,
};
use crate::events::{EventBus, Topic};
use crate::ids;
use crate::rolling::RollingWindow;

#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub client_ip: Option<String>,
    pub ingress_ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub egress_ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CapturedTraffic {
    pub request_id: String,
    pub session_id: String,
    pub subdomain: String,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub response_time_ms: Option<u64>,
    pub created_at: Instant,
}

impl CapturedTraffic {
    pub fn bytes_in(&self) -> usize {
        self.request.body.len()
    }

    pub fn bytes_out(&self) -> usize {
        self.response.as_ref().map_or(0, |r| r.body.len())
    }
}

#[derive(Debug, Clone)]
pub struct TrafficFilter {
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub path_regex: Option<regex::Regex>,
    pub since_ms: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TrafficFilter {
    fn default() -> Self {
        Self {
            method: None,
            status_code: None,
            path_regex: None,
            since_ms: None,
            limit: crate::constants::TRAFFIC_DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

struct TimeBucket {
    start_ms: i64,
    requests: u64,
    errors: u64,
}

struct InspectorState {
    entries: HashMap<String, CapturedTraffic>,
    /// Global insertion order, oldest at the front. Drives `MAX_STORED` eviction.
    order: VecDeque<String>,
    by_session: HashMap<String, VecDeque<String>>,
    requests_window: RollingWindow,
    bytes_in_window: RollingWindow,
    bytes_out_window: RollingWindow,
    latency_window: RollingWindow,
    method_counts: HashMap<String, u64>,
    path_counts: HashMap<String, u64>,
    status_counts: HashMap<u16, u64>,
    time_series: VecDeque<TimeBucket>,
    max_stored: usize,
    retention: std::time::Duration,
}

impl InspectorState {
    fn new(max_stored: usize, retention: std::time::Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            by_session: HashMap::new(),
            requests_window: RollingWindow::new(SHORT_WINDOW),
            bytes_in_window: RollingWindow::new(SHORT_WINDOW),
            bytes_out_window: RollingWindow::new(SHORT_WINDOW),
            latency_window: RollingWindow::new(LATENCY_WINDOW),
            method_counts: HashMap::new(),
            path_counts: HashMap::new(),
            status_counts: HashMap::new(),
            time_series: VecDeque::new(),
            max_stored,
            retention,
        }
    }

    fn per_session_cap(&self) -> usize {
        (self.max_stored / 2).max(1)
    }

    fn evict_oldest(&mut self) {
        if let Some(id) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&id) {
                if let Some(ids) = self.by_session.get_mut(&entry.session_id) {
                    ids.retain(|i| i != &id);
                }
            }
        }
    }

    fn bucket_for(&mut self, at_ms: i64) -> &mut TimeBucket {
        let bucket_ms = TIME_SERIES_BUCKET.as_millis() as i64;
        let start_ms = (at_ms / bucket_ms) * bucket_ms;
        let needs_new = self.time_series.back().map_or(true, |b| b.start_ms != start_ms);
        if needs_new {
            self.time_series.push_back(TimeBucket {
                start_ms,
                requests: 0,
                errors: 0,
            });
            while self.time_series.len() > TIME_SERIES_MAX_BUCKETS {
                self.time_series.pop_front();
            }
        }
        self.time_series.back_mut().expect("just pushed")
    }
}

pub struct Inspector {
    state: Mutex<InspectorState>,
    events: Arc<EventBus>,
}

impl Inspector {
    pub fn new(events: Arc<EventBus>, max_stored: usize, retention: std::time::Duration) -> Self {
        Self {
            state: Mutex::new(InspectorState::new(max_stored, retention)),
            events,
        }
    }

    /// Record a request event, creating a capture with no response half yet.
    /// Returns the generated `request_id`.
    pub async fn record_request(&self, session_id: &str, subdomain: &str, request: RequestSnapshot) -> String {
        let request_id = ids::request_id();
        let now = Instant::now();
        let bytes_in = request.body.len() as f64;
        let method = request.method.clone();
        let path = request.path.clone();

        let mut state = self.state.lock().await;
        state.requests_window.add(1.0, now);
        state.bytes_in_window.add(bytes_in, now);
        *state.method_counts.entry(method).or_insert(0) += 1;
        *state.path_counts.entry(path).or_insert(0) += 1;

        let capture = CapturedTraffic {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            subdomain: subdomain.to_string(),
            request,
            response: None,
            response_time_ms: None,
            created_at: now,
        };
        state.entries.insert(request_id.clone(), capture);
        state.order.push_back(request_id.clone());
        let cap = state.per_session_cap();
        let session_ids = state.by_session.entry(session_id.to_string()).or_default();
        session_ids.push_back(request_id.clone());
        while session_ids.len() > cap {
            session_ids.pop_front();
        }
        while state.order.len() > state.max_stored {
            state.evict_oldest();
        }
        drop(state);

        self.events.publish(
            Topic::TrafficRequest,
            serde_json::json!({ "request_id": request_id, "subdomain": subdomain }),
        );
        request_id
    }

    /// Write the response half of a capture. A second call for the same id
    /// is rejected (write-once per half, §3/§9) and logged, not applied.
    pub async fn record_response(&self, request_id: &str, response: ResponseSnapshot) -> Option<u64> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(request_id) else {
            warn!(request_id, "response for unknown or evicted capture, dropping");
            return None;
        };
        if entry.response.is_some() {
            warn!(request_id, "duplicate response for capture, dropping");
            return None;
        }

        let response_time_ms = (response.egress_ts_ms - entry.request.ingress_ts_ms).max(0) as u64;
        let status = response.status;
        let bytes_out = response.body.len() as f64;
        entry.response_time_ms = Some(response_time_ms);
        entry.response = Some(response);

        state.bytes_out_window.add(bytes_out, now);
        state.latency_window.add(response_time_ms as f64, now);
        *state.status_counts.entry(status).or_insert(0) += 1;
        let now_ms = now_millis();
        let bucket = state.bucket_for(now_ms);
        bucket.requests += 1;
        if status >= 400 {
            bucket.errors += 1;
        }
        drop(state);

        self.events.publish(
            Topic::TrafficResponse,
            serde_json::json!({ "request_id": request_id, "status": status, "response_time_ms": response_time_ms }),
        );
        Some(response_time_ms)
    }

    pub async fn get_by_id(&self, request_id: &str) -> Option<CapturedTraffic> {
        self.state.lock().await.entries.get(request_id).cloned()
    }

    pub async fn list(&self, filter: &TrafficFilter) -> Vec<CapturedTraffic> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.entries.get(id))
            .filter(|c| filter.method.as_deref().map_or(true, |m| c.request.method.eq_ignore_ascii_case(m)))
            .filter(|c| filter.status_code.map_or(true, |s| c.response.as_ref().map(|r| r.status) == Some(s)))
            .filter(|c| filter.path_regex.as_ref().map_or(true, |re| re.is_match(&c.request.path)))
            .filter(|c| filter.since_ms.map_or(true, |since| c.request.ingress_ts_ms >= since))
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect()
    }

    pub async fn purge(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.order.clear();
        state.by_session.clear();
    }

    pub async fn cleanup_tick(&self) {
        let mut state = self.state.lock().await;
        let retention = state.retention;
        let expired: Vec<String> = state
            .order
            .iter()
            .filter(|id| {
                state
                    .entries
                    .get(*id)
                    .map_or(false, |e| e.created_at.elapsed() > retention)
            })
            .cloned()
            .collect();
        for id in expired {
            if let Some(entry) = state.entries.remove(&id) {
                if let Some(ids) = state.by_session.get_mut(&entry.session_id) {
                    ids.retain(|i| i != &id);
                }
            }
            state.order.retain(|i| i != &id);
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().await;
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &InspectorState) -> MetricsSnapshot {
        // RollingWindow pruning needs `&mut`, so clone into a scratch copy
        // rather than widen the lock above to a write lock for a read path.
        let now = Instant::now();
        let mut requests_window = state.requests_window.clone();
        let mut latency_window = state.latency_window.clone();

        let request_count = requests_window.count(now) as f64;
        let throughput = request_count / SHORT_WINDOW.as_secs_f64();

        let mut samples = latency_window.values(now);
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let latency = LatencySummary::from_sorted(&samples);

        let total_responses: u64 = state.status_counts.values().sum();
        let error_responses: u64 = state
            .status_counts
            .iter()
            .filter(|(status, _)| **status >= 400)
            .map(|(_, count)| *count)
            .sum();
        let error_rate = if total_responses == 0 {
            0.0
        } else {
            (error_responses as f64 / total_responses as f64) * 100.0
        };

        let mut breakdown = ErrorBreakdown::default();
        for (status, count) in &state.status_counts {
            match status / 100 {
                2 => breakdown.class_2xx += count,
                3 => breakdown.class_3xx += count,
                4 => breakdown.class_4xx += count,
                5 => breakdown.class_5xx += count,
                _ => breakdown.other += count,
            }
        }

        let mut top_paths: Vec<(String, u64)> = state.path_counts.iter().map(|(p, c)| (p.clone(), *c)).collect();
        top_paths.sort_by(|a, b| b.1.cmp(&a.1));
        top_paths.truncate(TOP_PATHS_DEFAULT_K);

        let time_series = state
            .time_series
            .iter()
            .map(|b| TimeSeriesPoint {
                bucket_start_ms: b.start_ms,
                requests: b.requests,
                errors: b.errors,
            })
            .collect();

        MetricsSnapshot {
            throughput,
            latency,
            error_rate,
            error_breakdown: breakdown,
            top_paths,
            time_series,
            total_requests: request_count as u64,
            total_responses,
        }
    }

    /// Render the derived snapshot as Prometheus text exposition.
    pub async fn prometheus(&self) -> String {
        let snapshot = self.snapshot().await;
        format!(
            concat!(
                "# HELP portal_requests_total Total number of requests captured\n",
                "# TYPE portal_requests_total counter\n",
                "portal_requests_total {}\n",
                "\n",
                "# HELP portal_responses_by_status Responses by HTTP status class\n",
                "# TYPE portal_responses_by_status counter\n",
                "portal_responses_by_status{{status=\"2xx\"}} {}\n",
                "portal_responses_by_status{{status=\"3xx\"}} {}\n",
                "portal_responses_by_status{{status=\"4xx\"}} {}\n",
                "portal_responses_by_status{{status=\"5xx\"}} {}\n",
                "\n",
                "# HELP portal_latency_ms Response latency in milliseconds\n",
                "# TYPE portal_latency_ms summary\n",
                "portal_latency_ms{{quantile=\"0.5\"}} {}\n",
                "portal_latency_ms{{quantile=\"0.95\"}} {}\n",
                "portal_latency_ms{{quantile=\"0.99\"}} {}\n",
                "portal_latency_ms_avg {}\n",
                "\n",
                "# HELP portal_error_rate Percentage of responses that were 4xx/5xx\n",
                "# TYPE portal_error_rate gauge\n",
                "portal_error_rate {}\n",
            ),
            snapshot.total_requests,
            snapshot.error_breakdown.class_2xx,
            snapshot.error_breakdown.class_3xx,
            snapshot.error_breakdown.class_4xx,
            snapshot.error_breakdown.class_5xx,
            snapshot.latency.p50,
            snapshot.latency.p95,
            snapshot.latency.p99,
            snapshot.latency.avg,
            snapshot.error_rate,
        )
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySummary {
    fn from_sorted(sorted: &[f64]) -> Self {
        if sorted.is_empty() {
            return Self::default();
        }
        Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: percentile(sorted, 50.0),
            p95: percentile(sorted, 95.0),
            p99: percentile(sorted, 99.0),
        }
    }
}

/// Nearest-rank percentile: `sorted[ceil((p/100)*n) - 1]`, clamped to index 0.
/// `sorted` must already be ascending. Linear interpolation is deliberately
/// not used here (§9).
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len() as f64;
    let rank = (p / 100.0 * n).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorBreakdown {
    #[serde(rename = "2xx")]
    pub class_2xx: u64,
    #[serde(rename = "3xx")]
    pub class_3xx: u64,
    #[serde(rename = "4xx")]
    pub class_4xx: u64,
    #[serde(rename = "5xx")]
    pub class_5xx: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesPoint {
    pub bucket_start_ms: i64,
    pub requests: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub throughput: f64,
    pub latency: LatencySummary,
    pub error_rate: f64,
    pub error_breakdown: ErrorBreakdown,
    pub top_paths: Vec<(String, u64)>,
    pub time_series: Vec<TimeSeriesPoint>,
    pub total_requests: u64,
    pub total_responses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str, path: &str) -> RequestSnapshot {
        RequestSnapshot {
            method: method.to_string(),
            path: path.to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            client_ip: None,
            ingress_ts_ms: 1_000,
        }
    }

    fn resp(status: u16, egress_ts_ms: i64) -> ResponseSnapshot {
        ResponseSnapshot {
            status,
            headers: HashMap::new(),
            body: b"ok".to_vec(),
            egress_ts_ms,
        }
    }

    #[tokio::test]
    async fn request_then_response_produces_a_complete_capture() {
        let inspector = Inspector::new(Arc::new(EventBus::new()), 100, std::time::Duration::from_secs(60));
        let id = inspector.record_request("s1", "myapp", req("GET", "/ping")).await;
        inspector.record_response(&id, resp(200, 1_050)).await;

        let capture = inspector.get_by_id(&id).await.unwrap();
        assert!(capture.response.is_some());
        assert_eq!(capture.response_time_ms, Some(50));
    }

    #[tokio::test]
    async fn response_for_unknown_request_id_is_dropped() {
        let inspector = Inspector::new(Arc::new(EventBus::new()), 100, std::time::Duration::from_secs(60));
        let outcome = inspector.record_response("nonexistent", resp(200, 1_000)).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn duplicate_response_is_rejected_not_overwritten() {
        let inspector = Inspector::new(Arc::new(EventBus::new()), 100, std::time::Duration::from_secs(60));
        let id = inspector.record_request("s1", "myapp", req("GET", "/ping")).await;
        inspector.record_response(&id, resp(200, 1_010)).await;
        let second = inspector.record_response(&id, resp(500, 1_020)).await;
        assert!(second.is_none());
        let capture = inspector.get_by_id(&id).await.unwrap();
        assert_eq!(capture.response.unwrap().status, 200);
    }

    #[tokio::test]
    async fn global_ring_evicts_oldest_over_capacity() {
        let inspector = Inspector::new(Arc::new(EventBus::new()), 2, std::time::Duration::from_secs(60));
        let first = inspector.record_request("s1", "myapp", req("GET", "/a")).await;
        let _second = inspector.record_request("s1", "myapp", req("GET", "/b")).await;
        let _third = inspector.record_request("s1", "myapp", req("GET", "/c")).await;
        assert!(inspector.get_by_id(&first).await.is_none());
    }

    #[test]
    fn nearest_rank_percentile_matches_the_spec_formula() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&sorted, 50.0), 5.0);
        assert_eq!(percentile(&sorted, 95.0), 10.0);
        assert_eq!(percentile(&sorted, 99.0), 10.0);
    }

    #[test]
    fn percentile_of_empty_window_is_zero() {
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[tokio::test]
    async fn error_rate_counts_4xx_and_5xx() {
        let inspector = Inspector::new(Arc::new(EventBus::new()), 100, std::time::Duration::from_secs(60));
        for status in [200, 200, 404, 500] {
            let id = inspector.record_request("s1", "myapp", req("GET", "/x")).await;
            inspector.record_response(&id, resp(status, 1_100)).await;
        }
        let snapshot = inspector.snapshot().await;
        assert_eq!(snapshot.error_rate, 50.0);
    }
}
