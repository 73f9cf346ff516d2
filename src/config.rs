use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub api_prefix: String,
    pub socket_url: String,
    pub request_timeout_ms: u64,
    pub credential_path: Option<PathBuf>,
    pub query_stale_ms: u64,
    pub xsrf_cookie: String,
    pub xsrf_header: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ack_timeout_ms: u64,
    pub event_buffer: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".into(),
            api_prefix: "/api/v1".into(),
            socket_url: "ws://localhost:3000/ws".into(),
            request_timeout_ms: 10_000,
            credential_path: None,
            query_stale_ms: 60_000,
            xsrf_cookie: "XSRF-TOKEN".into(),
            xsrf_header: "x-xsrf-token".into(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            max_reconnect_attempts: 10,
            ack_timeout_ms: 5_000,
            event_buffer: 64,
            username: None,
            password: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let api_base_url = std::env::var("FEED_API_URL").unwrap_or(defaults.api_base_url);
        let api_prefix = std::env::var("FEED_API_PREFIX").unwrap_or(defaults.api_prefix);
        let socket_url = std::env::var("FEED_SOCKET_URL").unwrap_or(defaults.socket_url);
        let credential_path = std::env::var("FEED_CREDENTIAL_PATH").ok().map(PathBuf::from);
        let xsrf_cookie = std::env::var("FEED_XSRF_COOKIE").unwrap_or(defaults.xsrf_cookie);
        let xsrf_header = std::env::var("FEED_XSRF_HEADER").unwrap_or(defaults.xsrf_header);

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_prefix,
            socket_url,
            request_timeout_ms: env_parse("FEED_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            credential_path,
            query_stale_ms: env_parse("FEED_QUERY_STALE_MS", defaults.query_stale_ms)?,
            xsrf_cookie,
            xsrf_header,
            reconnect_base_ms: env_parse("FEED_RECONNECT_BASE_MS", defaults.reconnect_base_ms)?,
            reconnect_max_ms: env_parse("FEED_RECONNECT_MAX_MS", defaults.reconnect_max_ms)?,
            max_reconnect_attempts: env_parse(
                "FEED_MAX_RECONNECTS",
                defaults.max_reconnect_attempts,
            )?,
            ack_timeout_ms: env_parse("FEED_ACK_TIMEOUT_MS", defaults.ack_timeout_ms)?,
            event_buffer: env_parse("FEED_EVENT_BUFFER", defaults.event_buffer)?,
            username: std::env::var("FEED_USERNAME").ok(),
            password: std::env::var("FEED_PASSWORD").ok(),
        })
    }

    /// Full URL prefix every REST path is appended to.
    pub fn api_root(&self) -> String {
        format!("{}{}", self.api_base_url, self.api_prefix)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn query_stale_after(&self) -> Duration {
        Duration::from_millis(self.query_stale_ms)
    }
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a number")),
        Err(_) => Ok(default),
    }
}
