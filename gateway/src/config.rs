//! Process-environment configuration (§1 non-goal: no config file loading).
//!
//! Generalizes the teacher's `relay/src/main.rs` pattern of reading
//! `ZTUNNEL_DOMAIN`/`PORT` straight from the environment, with `.context(...)`
//! on the parts that can fail the way `client/src/config.rs` wraps its
//! fallible parsing with `anyhow::Context`.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants;

#[derive(Debug, Clone)]
pub struct Config {
    pub domain: String,
    pub port: u16,
    pub max_stored: usize,
    pub retention: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub allow_cidrs: Vec<String>,
    pub deny_cidrs: Vec<String>,
    pub rate_limit: u32,
    /// When set, `TUNNEL_REGISTER` must carry a matching `auth_token` or the
    /// attempt counts against the registering peer's failed-auth block table.
    pub auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            domain: env_or("PORTAL_DOMAIN", "portal.local"),
            port: env_parsed("PORTAL_PORT", 8080)?,
            max_stored: env_parsed("PORTAL_MAX_STORED", constants::MAX_STORED)?,
            retention: Duration::from_secs(env_parsed("PORTAL_RETENTION_SECS", constants::RETENTION.as_secs())?),
            heartbeat_interval: Duration::from_secs(env_parsed(
                "PORTAL_HEARTBEAT_SECS",
                constants::HEARTBEAT_INTERVAL.as_secs(),
            )?),
            request_timeout: Duration::from_secs(env_parsed(
                "PORTAL_REQUEST_TIMEOUT_SECS",
                constants::REQUEST_TIMEOUT.as_secs(),
            )?),
            allow_cidrs: env_list("PORTAL_ALLOW_CIDRS"),
            deny_cidrs: env_list("PORTAL_DENY_CIDRS"),
            rate_limit: env_parsed("PORTAL_RATE_LIMIT", 600)?,
            auth_token: std::env::var("PORTAL_AUTH_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("PORTAL_TEST_LIST", "10.0.0.0/8, 192.168.0.0/16 ,");
        let values = env_list("PORTAL_TEST_LIST");
        assert_eq!(values, vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()]);
        std::env::remove_var("PORTAL_TEST_LIST");
    }

    #[test]
    fn env_parsed_falls_back_on_missing_var() {
        std::env::remove_var("PORTAL_TEST_MISSING");
        let value: u16 = env_parsed("PORTAL_TEST_MISSING", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parsed_errors_on_invalid_value() {
        std::env::set_var("PORTAL_TEST_BAD", "not-a-number");
        let result: Result<u16> = env_parsed("PORTAL_TEST_BAD", 42);
        assert!(result.is_err());
        std::env::remove_var("PORTAL_TEST_BAD");
    }
}
