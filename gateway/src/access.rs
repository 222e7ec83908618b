//! Rate / Access Hooks (component I).
//!
//! The teacher has no rate limiting at all, so the sliding-window limiter
//! and failed-auth block table here are new, built on the same
//! [`RollingWindow`](crate::rolling::RollingWindow) the inspector uses for
//! its counters. The CIDR allow/deny check is adapted from the teacher's
//! `relay/src/ip_filter.rs` middleware (there, a per-tunnel layer wired
//! into axum directly) into a plain field of `AccessHooks`, since §4.9
//! scopes the allow/deny set to the whole process rather than per tunnel.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use portal_shared::{Error, ErrorKind, Result};

use crate::constants::{AUTH_BLOCK_DURATION, MAX_FAILED_AUTH, RATE_LIMIT_WINDOW};
use crate::rolling::RollingWindow;

#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch milliseconds at which the window will next have room.
    pub reset_at: i64,
    /// Populated only when `allowed` is false.
    pub retry_after: Option<u64>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sliding-window request counter, one window per key (tunnel id or
/// client IP depending on what the caller is limiting).
struct RateLimiter {
    windows: Mutex<HashMap<String, RollingWindow>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, key: &str, limit: u32) -> RateDecision {
        let now = Instant::now();
        let now_ms = now_millis();
        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| RollingWindow::new(RATE_LIMIT_WINDOW));

        // Peek before adding so a rejected request doesn't itself consume
        // a slot in the window.
        let count_before = window.count(now) as u32;
        if count_before >= limit {
            let oldest = window.oldest(now).unwrap_or(now);
            let retry_after = RATE_LIMIT_WINDOW.saturating_sub(now.saturating_duration_since(oldest));
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: now_ms + retry_after.as_millis() as i64,
                retry_after: Some(retry_after.as_secs().max(1)),
            };
        }

        window.add(1.0, now);
        let count = count_before + 1;
        let oldest = window.oldest(now).unwrap_or(now);
        let reset_in = RATE_LIMIT_WINDOW.saturating_sub(now.saturating_duration_since(oldest));
        RateDecision {
            allowed: true,
            remaining: limit.saturating_sub(count),
            reset_at: now_ms + reset_in.as_millis() as i64,
            retry_after: None,
        }
    }
}

struct FailedAuthState {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Tracks repeated failed `TUNNEL_REGISTER` auth attempts per key and
/// blocks the key for `AUTH_BLOCK_DURATION` once it crosses `MAX_FAILED_AUTH`.
struct FailedAuthTracker {
    states: Mutex<HashMap<String, FailedAuthState>>,
}

impl FailedAuthTracker {
    fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failed attempt. Returns `true` if this attempt is the
    /// one that crossed the threshold and triggered a block.
    fn record_failure(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap();
        let state = states.entry(key.to_string()).or_insert_with(|| FailedAuthState {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if now.saturating_duration_since(state.window_start) > RATE_LIMIT_WINDOW {
            state.count = 0;
            state.window_start = now;
        }

        state.count += 1;
        if state.count >= MAX_FAILED_AUTH && state.blocked_until.is_none() {
            state.blocked_until = Some(now + AUTH_BLOCK_DURATION);
            return true;
        }
        false
    }

    fn clear(&self, key: &str) {
        self.states.lock().unwrap().remove(key);
    }

    /// Remaining block duration, or `None` if the key isn't currently blocked.
    fn blocked_for(&self, key: &str) -> Option<Duration> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(key)?;
        let until = state.blocked_until?;
        let now = Instant::now();
        if now >= until {
            state.blocked_until = None;
            state.count = 0;
            return None;
        }
        Some(until - now)
    }
}

/// An IPv4 CIDR range, parsed once at startup from a `PORTAL_*_CIDRS` entry.
#[derive(Debug, Clone)]
struct Cidr {
    network: u32,
    mask: u32,
}

impl Cidr {
    fn parse(raw: &str) -> Option<Self> {
        let (addr, prefix_len) = raw.split_once('/')?;
        let ip = Ipv4Addr::from_str(addr).ok()?;
        let prefix_len: u32 = prefix_len.parse().ok()?;
        if prefix_len > 32 {
            return None;
        }
        let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
        Some(Cidr { network: u32::from(ip) & mask, mask })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => (u32::from(v4) & self.mask) == self.network,
            IpAddr::V6(_) => false,
        }
    }
}

/// Bundles the three access checks the control channel and public ingress
/// run on every inbound request: IP allow/deny, sliding-window rate limits,
/// and the failed-auth block table. The allow/deny set is process-wide and
/// fixed at startup, per §4.9's "in-memory allow/deny set".
pub struct AccessHooks {
    limiter: RateLimiter,
    failed_auth: FailedAuthTracker,
    allow: Vec<Cidr>,
    deny: Vec<Cidr>,
}

impl AccessHooks {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        Self {
            limiter: RateLimiter::new(),
            failed_auth: FailedAuthTracker::new(),
            allow: allow.iter().filter_map(|s| Cidr::parse(s)).collect(),
            deny: deny.iter().filter_map(|s| Cidr::parse(s)).collect(),
        }
    }

    pub fn check_rate(&self, key: &str, limit: u32) -> RateDecision {
        self.limiter.check(key, limit)
    }

    /// Denies if `ip` matches the deny list; otherwise allows if the allow
    /// list is empty or `ip` matches it.
    pub fn check_ip(&self, ip: IpAddr) -> Result<()> {
        if self.deny.iter().any(|cidr| cidr.contains(ip)) {
            return Err(Error::new(ErrorKind::Forbidden, format!("{ip} matches a denied CIDR range")));
        }
        if self.allow.is_empty() || self.allow.iter().any(|cidr| cidr.contains(ip)) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Forbidden, format!("{ip} does not match any allowed CIDR range")))
        }
    }

    /// Returns an error if `key` is currently within its auth block window.
    pub fn check_not_blocked(&self, key: &str) -> Result<()> {
        match self.failed_auth.blocked_for(key) {
            Some(remaining) => Err(Error::new(
                ErrorKind::Forbidden,
                format!("blocked for {}s after repeated failed auth", remaining.as_secs().max(1)),
            )),
            None => Ok(()),
        }
    }

    pub fn record_failed_auth(&self, key: &str) -> bool {
        self.failed_auth.record_failure(key)
    }

    pub fn clear_failed_auth(&self, key: &str) {
        self.failed_auth.clear(key);
    }
}

impl Default for AccessHooks {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}

/// Client IP for rate limiting and the allow/deny check: the leftmost
/// `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn extract_client_ip(headers: &HashMap<String, String>, peer_addr: Option<std::net::SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("x-forwarded-for"));
    if let Some((_, value)) = forwarded {
        if let Some(ip) = value.split(',').next().and_then(|s| IpAddr::from_str(s.trim()).ok()) {
            return Some(ip);
        }
    }

    let real_ip = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("x-real-ip"));
    if let Some((_, value)) = real_ip {
        if let Ok(ip) = IpAddr::from_str(value.trim()) {
            return Some(ip);
        }
    }

    peer_addr.map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_limit() {
        let hooks = AccessHooks::new(&[], &[]);
        for _ in 0..5 {
            let decision = hooks.check_rate("tunnel-a", 5);
            assert!(decision.allowed);
        }
    }

    #[test]
    fn blocks_the_request_that_exceeds_the_limit() {
        let hooks = AccessHooks::new(&[], &[]);
        for _ in 0..5 {
            assert!(hooks.check_rate("tunnel-b", 5).allowed);
        }
        let decision = hooks.check_rate("tunnel-b", 5);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after.is_some());
    }

    #[test]
    fn keys_are_independent() {
        let hooks = AccessHooks::new(&[], &[]);
        for _ in 0..5 {
            hooks.check_rate("x", 5);
        }
        assert!(hooks.check_rate("y", 5).allowed);
    }

    #[test]
    fn failed_auth_blocks_after_threshold() {
        let hooks = AccessHooks::new(&[], &[]);
        let mut tripped = false;
        for _ in 0..MAX_FAILED_AUTH {
            tripped = hooks.record_failed_auth("1.2.3.4");
        }
        assert!(tripped);
        assert!(hooks.check_not_blocked("1.2.3.4").is_err());
    }

    #[test]
    fn clearing_failed_auth_unblocks() {
        let hooks = AccessHooks::new(&[], &[]);
        for _ in 0..MAX_FAILED_AUTH {
            hooks.record_failed_auth("5.6.7.8");
        }
        assert!(hooks.check_not_blocked("5.6.7.8").is_err());
        hooks.clear_failed_auth("5.6.7.8");
        assert!(hooks.check_not_blocked("5.6.7.8").is_ok());
    }

    #[test]
    fn deny_list_rejects_a_matching_ip() {
        let hooks = AccessHooks::new(&[], &["10.0.0.0/8".to_string()]);
        let err = hooks.check_ip("10.1.2.3".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Forbidden));
    }

    #[test]
    fn deny_wins_over_an_overlapping_allow() {
        let hooks = AccessHooks::new(&["192.168.1.0/24".to_string()], &["192.168.1.100/32".to_string()]);
        assert!(hooks.check_ip("192.168.1.50".parse().unwrap()).is_ok());
        assert!(hooks.check_ip("192.168.1.100".parse().unwrap()).is_err());
        assert!(hooks.check_ip("10.0.0.1".parse().unwrap()).is_err());
    }

    #[test]
    fn empty_lists_allow_everything() {
        let hooks = AccessHooks::new(&[], &[]);
        assert!(hooks.check_ip("1.2.3.4".parse().unwrap()).is_ok());
    }

    #[test]
    fn cidr_boundary_is_inclusive() {
        let hooks = AccessHooks::new(&["192.168.1.0/24".to_string()], &[]);
        assert!(hooks.check_ip("192.168.1.0".parse().unwrap()).is_ok());
        assert!(hooks.check_ip("192.168.1.255".parse().unwrap()).is_ok());
        assert!(hooks.check_ip("192.168.2.1".parse().unwrap()).is_err());
    }

    #[test]
    fn extract_client_ip_prefers_forwarded_for_over_peer() {
        let mut headers = HashMap::new();
        headers.insert("X-Forwarded-For".to_string(), "203.0.113.9, 10.0.0.1".to_string());
        let peer = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(extract_client_ip(&headers, Some(peer)), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_peer_addr() {
        let peer = "198.51.100.7:9000".parse().unwrap();
        assert_eq!(extract_client_ip(&HashMap::new(), Some(peer)), Some("198.51.100.7".parse().unwrap()));
    }
}
