use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::time::Duration;

use crate::broadcaster::{
    Limits, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_QUEUED_MESSAGES, DEFAULT_MAX_SUBSCRIBERS_PER_CASE,
};
use crate::error::ConfigError;

const BIND: &str = "CASE_EVENTS_BIND";
const INTERNAL_BIND: &str = "CASE_EVENTS_INTERNAL_BIND";
const MAX_PAYLOAD_BYTES: &str = "CASE_EVENTS_MAX_PAYLOAD_BYTES";
const MAX_SUBSCRIBERS_PER_CASE: &str = "CASE_EVENTS_MAX_SUBSCRIBERS_PER_CASE";
const MAX_QUEUED_MESSAGES: &str = "CASE_EVENTS_MAX_QUEUED_MESSAGES";
const KEEPALIVE_SECS: &str = "CASE_EVENTS_KEEPALIVE_SECS";

const DEFAULT_KEEPALIVE_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Browser-facing listener: live-update streams and health.
    pub bind: SocketAddr,
    /// Listener for the publish endpoint. Keep it off the public network.
    pub internal_bind: SocketAddr,
    pub limits: Limits,
    /// `None` disables keep-alive comments.
    pub keepalive: Option<Duration>,
}

impl Config {
    /// Read the process environment. Call [`load_dotenv`] first to pick up a
    /// `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = parse(&lookup, BIND)?.unwrap_or_else(default_bind);
        let internal_bind = parse(&lookup, INTERNAL_BIND)?.unwrap_or_else(default_internal_bind);
        let max_payload_bytes = parse(&lookup, MAX_PAYLOAD_BYTES)?.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);
        let max_subscribers_per_case =
            parse(&lookup, MAX_SUBSCRIBERS_PER_CASE)?.unwrap_or(DEFAULT_MAX_SUBSCRIBERS_PER_CASE);
        let max_queued_messages =
            parse(&lookup, MAX_QUEUED_MESSAGES)?.unwrap_or(DEFAULT_MAX_QUEUED_MESSAGES);
        let keepalive_secs: u64 = parse(&lookup, KEEPALIVE_SECS)?.unwrap_or(DEFAULT_KEEPALIVE_SECS);

        Ok(Self {
            bind,
            internal_bind,
            limits: Limits {
                max_payload_bytes,
                max_subscribers_per_case,
                max_queued_messages,
            },
            keepalive: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            internal_bind: default_internal_bind(),
            limits: Limits::default(),
            keepalive: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
        }
    }
}

/// Load `.env` into the process environment. A missing file is not an error.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_internal_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3001))
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.clone(),
            reason: e.to_string(),
        })
}
