//! Session (component B) — one live agent's control channel.
//!
//! Owns the pending-request table, the outbound write lock, and liveness
//! tracking. Grounded on the teacher's `relay/src/tunnel.rs::Tunnel`
//! (subdomain + outbound channel + `DashMap` pending map), generalized with
//! the heartbeat/liveness and streaming-response assembly the spec's
//! component B and §5 concurrency contract require.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use portal_shared::protocol::Frame;

/// What a pending request eventually resolves to.
#[derive(Debug, Clone)]
pub enum ForwardOutcome {
    Response {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    Error {
        status: u16,
        code: String,
        message: String,
    },
    SessionClosed,
}

/// An inbound event destined for a pending request, as decoded by the
/// control-channel server from `HTTP_RESPONSE`/`_CHUNK`/`_END`/`HTTP_ERROR`.
#[derive(Debug)]
pub enum InboundOutcome {
    Unary {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    StreamStart {
        status: u16,
        headers: HashMap<String, String>,
    },
    StreamChunk {
        index: u64,
        chunk: Vec<u8>,
    },
    StreamEnd,
    Error {
        status: u16,
        code: String,
        message: String,
    },
}

struct StreamState {
    status: u16,
    headers: HashMap<String, String>,
    chunks: HashMap<u64, Vec<u8>>,
    max_index: Option<u64>,
}

/// Ephemeral bookkeeping for one in-flight request on this session.
struct PendingEntry {
    tx: Mutex<Option<oneshot::Sender<ForwardOutcome>>>,
    stream: Mutex<Option<StreamState>>,
}

/// One live agent connection.
#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub created_at: Instant,
    last_activity_nanos: Arc<AtomicI64>,
    alive: Arc<AtomicBool>,
    /// Serializes writes: only one frame may be in flight on the wire at a
    /// time. Holding this across the single `send` call on the underlying
    /// channel is the session's entire critical section.
    writer: Arc<Mutex<mpsc::Sender<String>>>,
    pending: Arc<DashMap<String, PendingEntry>>,
}

impl Session {
    pub fn new(
        session_id: String,
        subdomain: String,
        local_port: u16,
        writer: mpsc::Sender<String>,
    ) -> Self {
        Self {
            session_id,
            subdomain,
            local_port,
            created_at: Instant::now(),
            last_activity_nanos: Arc::new(AtomicI64::new(now_nanos())),
            alive: Arc::new(AtomicBool::new(true)),
            writer: Arc::new(Mutex::new(writer)),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_activity_nanos.store(now_nanos(), Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_nanos.load(Ordering::Acquire);
        let now = now_nanos();
        Duration::from_nanos(now.saturating_sub(last).max(0) as u64)
    }

    /// Send a frame through the write lock. Failure marks the session
    /// unhealthy; the caller is responsible for tearing it down.
    pub async fn send(&self, frame: &Frame) -> Result<(), portal_shared::Error> {
        let text = portal_shared::codec::encode(frame)
            .map_err(|e| portal_shared::Error::Codec(e.to_string()))?;
        let sender = self.writer.lock().await;
        if sender.send(text).await.is_err() {
            self.alive.store(false, Ordering::Release);
            return Err(portal_shared::Error::new(
                portal_shared::ErrorKind::ConnectionClosed,
                "session writer closed",
            ));
        }
        Ok(())
    }

    /// Register a waiter before the `HTTP_REQUEST` frame is sent, so that
    /// `register_pending` strictly happens-before any possible
    /// `deliver`/`cancel` for the same id (§5 ordering contract).
    pub fn register_pending(&self, request_id: &str) -> oneshot::Receiver<ForwardOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            PendingEntry {
                tx: Mutex::new(Some(tx)),
                stream: Mutex::new(None),
            },
        );
        rx
    }

    /// Remove a pending entry without resolving it (timeout or client
    /// disconnect cancellation).
    pub fn cancel_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deliver an inbound frame event for `request_id`. Returns `true` if a
    /// pending entry existed (late/duplicate deliveries return `false`).
    pub async fn deliver(&self, request_id: &str, outcome: InboundOutcome) -> bool {
        let Some(entry) = self.pending.get(request_id) else {
            return false;
        };

        match outcome {
            InboundOutcome::Unary { status, headers, body } => {
                self.resolve(&entry, ForwardOutcome::Response { status, headers, body })
                    .await;
                drop(entry);
                self.pending.remove(request_id);
            }
            InboundOutcome::StreamStart { status, headers } => {
                let mut stream = entry.stream.lock().await;
                *stream = Some(StreamState {
                    status,
                    headers,
                    chunks: HashMap::new(),
                    max_index: None,
                });
            }
            InboundOutcome::StreamChunk { index, chunk } => {
                let mut stream = entry.stream.lock().await;
                if let Some(state) = stream.as_mut() {
                    state.max_index = Some(state.max_index.map_or(index, |m| m.max(index)));
                    state.chunks.insert(index, chunk);
                } else {
                    warn!(request_id, "chunk arrived before stream start, dropping");
                }
            }
            InboundOutcome::StreamEnd => {
                let assembled = {
                    let mut stream = entry.stream.lock().await;
                    stream.take()
                };
                if let Some(state) = assembled {
                    let mut body = Vec::new();
                    if let Some(max_index) = state.max_index {
                        for i in 0..=max_index {
                            match state.chunks.get(&i) {
                                Some(chunk) => body.extend_from_slice(chunk),
                                None => warn!(request_id, index = i, "gap in chunk sequence"),
                            }
                        }
                    }
                    self.resolve(
                        &entry,
                        ForwardOutcome::Response {
                            status: state.status,
                            headers: state.headers,
                            body,
                        },
                    )
                    .await;
                } else {
                    warn!(request_id, "HTTP_RESPONSE_END with no open stream");
                }
                drop(entry);
                self.pending.remove(request_id);
            }
            InboundOutcome::Error { status, code, message } => {
                self.resolve(&entry, ForwardOutcome::Error { status, code, message })
                    .await;
                drop(entry);
                self.pending.remove(request_id);
            }
        }
        true
    }

    async fn resolve(&self, entry: &PendingEntry, outcome: ForwardOutcome) {
        if let Some(tx) = entry.tx.lock().await.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Idempotent teardown: marks the session dead and drains every pending
    /// waiter with `SESSION_CLOSED`.
    pub async fn close(&self) -> Vec<String> {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some((_, entry)) = self.pending.remove(id) {
                self.resolve(&entry, ForwardOutcome::SessionClosed).await;
            }
        }
        ids
    }
}

fn now_nanos() -> i64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session() -> (Session, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Session::new("sess1".into(), "myapp".into(), 3000, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn unary_response_resolves_waiter() {
        let (session, _rx) = make_session();
        let rx = session.register_pending("r1");
        let delivered = session
            .deliver(
                "r1",
                InboundOutcome::Unary {
                    status: 200,
                    headers: HashMap::new(),
                    body: b"pong".to_vec(),
                },
            )
            .await;
        assert!(delivered);
        match rx.await.unwrap() {
            ForwardOutcome::Response { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, b"pong");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn streaming_chunks_concatenate_in_order() {
        let (session, _rx) = make_session();
        let rx = session.register_pending("r2");
        session
            .deliver(
                "r2",
                InboundOutcome::StreamStart {
                    status: 200,
                    headers: HashMap::new(),
                },
            )
            .await;
        session
            .deliver(
                "r2",
                InboundOutcome::StreamChunk {
                    index: 1,
                    chunk: b"world".to_vec(),
                },
            )
            .await;
        session
            .deliver(
                "r2",
                InboundOutcome::StreamChunk {
                    index: 0,
                    chunk: b"hello ".to_vec(),
                },
            )
            .await;
        session.deliver("r2", InboundOutcome::StreamEnd).await;

        match rx.await.unwrap() {
            ForwardOutcome::Response { body, .. } => assert_eq!(body, b"hello world"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_chunk_index_leaves_a_gap_not_a_failure() {
        let (session, _rx) = make_session();
        let rx = session.register_pending("r3");
        session
            .deliver(
                "r3",
                InboundOutcome::StreamStart { status: 200, headers: HashMap::new() },
            )
            .await;
        session
            .deliver("r3", InboundOutcome::StreamChunk { index: 0, chunk: b"a".to_vec() })
            .await;
        session
            .deliver("r3", InboundOutcome::StreamChunk { index: 2, chunk: b"c".to_vec() })
            .await;
        session.deliver("r3", InboundOutcome::StreamEnd).await;

        match rx.await.unwrap() {
            ForwardOutcome::Response { body, .. } => assert_eq!(body, b"ac"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_drains_pending_with_session_closed() {
        let (session, _rx) = make_session();
        let rx = session.register_pending("r4");
        session.close().await;
        match rx.await.unwrap() {
            ForwardOutcome::SessionClosed => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _rx) = make_session();
        let first = session.close().await;
        let second = session.close().await;
        assert!(second.is_empty() || first.len() >= second.len());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn cancel_pending_removes_without_resolving() {
        let (session, _rx) = make_session();
        let rx = session.register_pending("r5");
        session.cancel_pending("r5");
        assert_eq!(session.pending_count(), 0);
        assert!(rx.await.is_err());
    }
}
