//! Named tunables from the spec's data model and component design.
//!
//! Collected here rather than scattered as inline literals so each one is
//! traceable to the section that names it.

use std::time::Duration;

/// §3 Subdomain — length bounds (inclusive).
pub const SUBDOMAIN_MIN_LEN: usize = 3;
pub const SUBDOMAIN_MAX_LEN: usize = 32;

/// §3 Subdomain — the fixed reserved set.
pub const RESERVED_SUBDOMAINS: &[&str] =
    &["www", "api", "admin", "dashboard", "auth", "health", "metrics"];

/// §3 Captured Traffic — global ring capacity.
pub const MAX_STORED: usize = 1000;

/// §3 Captured Traffic — eviction age.
pub const RETENTION: Duration = Duration::from_secs(30 * 60);

/// §3 Captured Traffic — cleanup tick (§4.7).
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// §4.2 Session — heartbeat ticker.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// §4.4 Request Forwarder — deadline for a pending request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// §4.3 Tunnel Registry — retries for a generated subdomain before
/// `SUBDOMAIN_GENERATION_FAILED`.
pub const SUBDOMAIN_GENERATION_RETRIES: u32 = 10;

/// §4.3 Tunnel Registry — length of a generated subdomain.
pub const GENERATED_SUBDOMAIN_LEN: usize = 8;

/// §3 Rolling Window — request count / byte counters.
pub const SHORT_WINDOW: Duration = Duration::from_secs(60);

/// §3 Rolling Window — latency samples.
pub const LATENCY_WINDOW: Duration = Duration::from_secs(300);

/// §4.7 Inspector — metrics tick.
pub const METRICS_TICK: Duration = Duration::from_secs(5);

/// §4.7 Inspector — time-series bucket width and cap (5 min of 5 s buckets).
pub const TIME_SERIES_BUCKET: Duration = Duration::from_secs(5);
pub const TIME_SERIES_MAX_BUCKETS: usize = 60;

/// §4.7 Inspector — default `top_paths` k.
pub const TOP_PATHS_DEFAULT_K: usize = 10;

/// §4.9 Rate / Access Hooks — sliding window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// §4.9 Rate / Access Hooks — failed-auth block table.
pub const MAX_FAILED_AUTH: u32 = 5;
pub const AUTH_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// §4.8 Replay Engine — bounded FIFO history.
pub const REPLAY_HISTORY_CAP: usize = 100;

/// §4.4 Request Forwarder — headers stripped before crossing either
/// tunnel boundary.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
];

/// §6 Management HTTP surface — default page size for `/traffic`.
pub const TRAFFIC_DEFAULT_LIMIT: usize = 50;
