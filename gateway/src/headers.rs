//! Hop-by-hop header stripping and standard proxy header injection.
//!
//! Trimmed down from the teacher's `relay/src/headers.rs::HeaderRewriter`,
//! which also did CORS injection and a generic add/set/remove rule engine —
//! dropped, since nothing in the spec names a policy rule engine (that was
//! the dropped `policy.rs`'s job). What's kept: hop-by-hop stripping on
//! both tunnel boundaries (§4.4, §4.8) and the `X-Forwarded-*`/`X-Real-IP`
//! injection the teacher always applied when forwarding into the tunnel.

use std::collections::HashMap;

use crate::constants::HOP_BY_HOP_HEADERS;

/// Remove headers that apply only to a single transport hop, case-insensitively.
pub fn strip_hop_by_hop(headers: &mut HashMap<String, String>) {
    let to_remove: Vec<String> = headers
        .keys()
        .filter(|k| HOP_BY_HOP_HEADERS.iter().any(|hbh| hbh.eq_ignore_ascii_case(k)))
        .cloned()
        .collect();
    for key in to_remove {
        headers.remove(&key);
    }
}

/// Inject standard reverse-proxy headers before a request crosses into the
/// tunnel, so the developer's local server sees the original client.
pub fn inject_proxy_headers(headers: &mut HashMap<String, String>, client_ip: Option<&str>, host: &str) {
    upsert(headers, "X-Forwarded-For", client_ip.unwrap_or("unknown"));
    upsert(headers, "X-Forwarded-Proto", "https");
    upsert(headers, "X-Forwarded-Host", host);
    upsert(headers, "X-Real-IP", client_ip.unwrap_or("unknown"));
}

fn upsert(headers: &mut HashMap<String, String>, key: &str, value: &str) {
    if let Some(existing) = headers.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned() {
        headers.insert(existing, value.to_string());
    } else {
        headers.insert(key.to_string(), value.to_string());
    }
}
