//! Tunnel Registry (component C) — subdomain ↔ session bookkeeping.
//!
//! Grounded on the `tunnels: Arc<RwLock<HashMap<String, Tunnel>>>` field of
//! the teacher's `relay/src/main.rs::AppState` and the shape of the
//! teacher's (otherwise-unused) `relay/src/router.rs::SubdomainRouter`,
//! extended with the id→session and session→ids reverse indices §4.3 names
//! and with proper `SUBDOMAIN_TAKEN`/`SUBDOMAIN_INVALID` semantics in place
//! of the teacher's silent suffix-on-conflict behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::info;

use portal_shared::{Error, ErrorKind, Result};

use crate::constants::{RESERVED_SUBDOMAINS, SUBDOMAIN_GENERATION_RETRIES, SUBDOMAIN_MAX_LEN, SUBDOMAIN_MIN_LEN};
use crate::events::{EventBus, Topic};
use crate::ids;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub session_id: String,
    pub created_at: Instant,
}

pub struct RegisterRequest {
    pub requested_subdomain: Option<String>,
    pub local_port: u16,
    pub session: Session,
}

struct Entry {
    info: TunnelInfo,
    session: Session,
}

pub struct Registry {
    by_subdomain: RwLock<HashMap<String, String>>, // subdomain -> tunnel_id
    by_id: RwLock<HashMap<String, Entry>>,
    by_session: RwLock<HashMap<String, Vec<String>>>, // session_id -> tunnel_ids
    events: Arc<EventBus>,
}

impl Registry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            by_subdomain: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Case-fold and validate a subdomain's shape (length, charset). Does
    /// not check uniqueness or the reserved set.
    fn validate_shape(subdomain: &str) -> Result<String> {
        let folded = subdomain.to_lowercase();
        if folded.len() < SUBDOMAIN_MIN_LEN || folded.len() > SUBDOMAIN_MAX_LEN {
            return Err(Error::new(
                ErrorKind::SubdomainInvalid,
                format!(
                    "subdomain length must be {SUBDOMAIN_MIN_LEN}-{SUBDOMAIN_MAX_LEN}, got {}",
                    folded.len()
                ),
            ));
        }
        if !folded.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(Error::new(
                ErrorKind::SubdomainInvalid,
                "subdomain must be lowercase alphanumeric",
            ));
        }
        Ok(folded)
    }

    pub fn is_reserved(subdomain: &str) -> bool {
        RESERVED_SUBDOMAINS.contains(&subdomain)
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<TunnelInfo> {
        let subdomain = match req.requested_subdomain {
            Some(requested) => {
                let folded = Self::validate_shape(&requested)?;
                if Self::is_reserved(&folded) {
                    return Err(ErrorKind::SubdomainTaken.into());
                }
                let existing = self.by_subdomain.read().await;
                if existing.contains_key(&folded) {
                    return Err(ErrorKind::SubdomainTaken.into());
                }
                drop(existing);
                folded
            }
            None => self.generate_subdomain().await?,
        };

        let tunnel_id = ids::random_token(16);
        let session_id = req.session.session_id.clone();
        let info = TunnelInfo {
            tunnel_id: tunnel_id.clone(),
            subdomain: subdomain.clone(),
            local_port: req.local_port,
            session_id: session_id.clone(),
            created_at: Instant::now(),
        };

        {
            let mut by_subdomain = self.by_subdomain.write().await;
            // Re-check under the write lock to close the race between the
            // read above and this insert.
            if by_subdomain.contains_key(&subdomain) {
                return Err(ErrorKind::SubdomainTaken.into());
            }
            by_subdomain.insert(subdomain.clone(), tunnel_id.clone());
        }
        self.by_id.write().await.insert(
            tunnel_id.clone(),
            Entry {
                info: info.clone(),
                session: req.session,
            },
        );
        self.by_session
            .write()
            .await
            .entry(session_id)
            .or_default()
            .push(tunnel_id.clone());

        self.events.publish(Topic::TunnelCreated, serde_json::json!({
            "tunnel_id": info.tunnel_id,
            "subdomain": info.subdomain,
        }));
        info!(subdomain = %info.subdomain, tunnel_id = %info.tunnel_id, "tunnel registered");

        Ok(info)
    }

    async fn generate_subdomain(&self) -> Result<String> {
        let by_subdomain = self.by_subdomain.read().await;
        for _ in 0..SUBDOMAIN_GENERATION_RETRIES {
            let candidate = ids::generated_subdomain();
            if !by_subdomain.contains_key(&candidate) && !Self::is_reserved(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ErrorKind::SubdomainGenerationFailed.into())
    }

    pub async fn lookup(&self, subdomain: &str) -> Option<Session> {
        let folded = subdomain.to_lowercase();
        let tunnel_id = self.by_subdomain.read().await.get(&folded).cloned()?;
        self.by_id.read().await.get(&tunnel_id).map(|e| e.session.clone())
    }

    pub async fn lookup_by_id(&self, tunnel_id: &str) -> Option<Session> {
        self.by_id.read().await.get(tunnel_id).map(|e| e.session.clone())
    }

    pub async fn info(&self, tunnel_id: &str) -> Option<TunnelInfo> {
        self.by_id.read().await.get(tunnel_id).map(|e| e.info.clone())
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        self.by_id.read().await.values().map(|e| e.info.clone()).collect()
    }

    pub async fn close(&self, tunnel_id: &str, reason: &str) {
        let entry = self.by_id.write().await.remove(tunnel_id);
        let Some(entry) = entry else { return };

        self.by_subdomain.write().await.remove(&entry.info.subdomain);
        if let Some(ids) = self.by_session.write().await.get_mut(&entry.info.session_id) {
            ids.retain(|id| id != tunnel_id);
        }

        entry.session.close().await;

        let duration_ms = entry.info.created_at.elapsed().as_millis() as u64;
        self.events.publish(
            Topic::TunnelClosed,
            serde_json::json!({
                "tunnel_id": tunnel_id,
                "subdomain": entry.info.subdomain,
                "duration_ms": duration_ms,
                "reason": reason,
            }),
        );
        info!(tunnel_id, reason, duration_ms, "tunnel closed");
    }

    /// Close every tunnel bound to a given underlying connection, in O(k)
    /// via the session→ids reverse index. Used on transport disconnect.
    pub async fn close_by_session(&self, session_id: &str, reason: &str) {
        let ids = self.by_session.write().await.remove(session_id).unwrap_or_default();
        for tunnel_id in ids {
            self.close(&tunnel_id, reason).await;
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.by_id.read().await.keys().cloned().collect();
        for id in ids {
            self.close(&id, "shutdown").await;
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnel_count: self.by_id.read().await.len(),
        }
    }
}

pub struct RegistryStats {
    pub tunnel_count: usize,
}
