//! Environment-driven configuration structures shared by all binaries.

use std::{env, str::FromStr, time::Duration};

use thiserror::Error;

use crate::capability::StreamOptions;
use crate::services::rate_limit::{RateLimitConfig, RateLimitStrategy};

const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 3000;
const DEFAULT_PROMETHEUS_PORT: u16 = 8080;
const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: u64 = 76_000;
const DEFAULT_HEADERS_TIMEOUT_MS: u64 = 77_000;
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 1_000;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 3_600;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WEBSOCKET_PATH: &str = "/ws";
const DEFAULT_WEBSOCKET_HEARTBEAT_MS: u64 = 30_000;

/// Listener and per-connection settings read by the HTTP bootstrap. The
/// metrics port is compared against the primary port to decide whether the
/// metrics router shares the application listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    http_host: String,
    http_port: u16,
    metrics_port: u16,
    keep_alive_timeout: Duration,
    headers_timeout: Duration,
    workers: usize,
    meta_txn_rate_limit: Option<RateLimitConfig>,
    stream_options: StreamOptions,
}

impl RuntimeConfig {
    /// Loads only the environment variables required by the API binary.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let meta_txn_rate_limit = match get_optional_var("META_TXN_RATE_LIMIT_TYPE") {
            Some(tag) => {
                let strategy = RateLimitStrategy::from_str(&tag)
                    .map_err(|_| ConfigError::UnknownRateLimitStrategy { tag: tag.clone() })?;
                Some(RateLimitConfig::new(
                    strategy,
                    parse_or(
                        "META_TXN_RATE_LIMIT_MAX_REQUESTS",
                        DEFAULT_RATE_LIMIT_MAX_REQUESTS,
                    )?,
                    Duration::from_secs(parse_or(
                        "META_TXN_RATE_LIMIT_WINDOW_SECS",
                        DEFAULT_RATE_LIMIT_WINDOW_SECS,
                    )?),
                ))
            }
            None => None,
        };

        let heartbeat = Duration::from_millis(parse_or(
            "WEBSOCKET_HEARTBEAT_MS",
            DEFAULT_WEBSOCKET_HEARTBEAT_MS,
        )?);
        let stream_options = StreamOptions::new(
            get_optional_var("WEBSOCKET_PATH")
                .unwrap_or_else(|| DEFAULT_WEBSOCKET_PATH.to_string()),
            heartbeat,
        );

        Ok(Self {
            http_host: get_optional_var("HTTP_HOST")
                .unwrap_or_else(|| DEFAULT_HTTP_HOST.to_string()),
            http_port: parse_or("HTTP_PORT", DEFAULT_HTTP_PORT)?,
            metrics_port: parse_or("PROMETHEUS_PORT", DEFAULT_PROMETHEUS_PORT)?,
            keep_alive_timeout: Duration::from_millis(parse_or(
                "HTTP_KEEP_ALIVE_TIMEOUT",
                DEFAULT_KEEP_ALIVE_TIMEOUT_MS,
            )?),
            headers_timeout: Duration::from_millis(parse_or(
                "HTTP_HEADERS_TIMEOUT",
                DEFAULT_HEADERS_TIMEOUT_MS,
            )?),
            workers: parse_or::<usize>("HTTP_WORKERS", DEFAULT_WORKERS)?.max(1),
            meta_txn_rate_limit,
            stream_options,
        })
    }

    /// Builds a configuration for the given ports with every other knob at
    /// its default. Used by embedders and tests that skip the environment.
    pub fn with_ports(http_host: impl Into<String>, http_port: u16, metrics_port: u16) -> Self {
        Self {
            http_host: http_host.into(),
            http_port,
            metrics_port,
            keep_alive_timeout: Duration::from_millis(DEFAULT_KEEP_ALIVE_TIMEOUT_MS),
            headers_timeout: Duration::from_millis(DEFAULT_HEADERS_TIMEOUT_MS),
            workers: DEFAULT_WORKERS,
            meta_txn_rate_limit: None,
            stream_options: StreamOptions::default(),
        }
    }

    /// Overrides the idle keep-alive period and the deadline for a client to
    /// finish sending request headers.
    pub fn with_timeouts(mut self, keep_alive: Duration, headers: Duration) -> Self {
        self.keep_alive_timeout = keep_alive;
        self.headers_timeout = headers;
        self
    }

    pub fn http_host(&self) -> &str {
        &self.http_host
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn metrics_port(&self) -> u16 {
        self.metrics_port
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    pub fn headers_timeout(&self) -> Duration {
        self.headers_timeout
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn meta_txn_rate_limit(&self) -> Option<&RateLimitConfig> {
        self.meta_txn_rate_limit.as_ref()
    }

    pub fn stream_options(&self) -> &StreamOptions {
        &self.stream_options
    }
}

/// Where each capability's upstream backend lives. Staking and order-book
/// upstreams are required; an unset optional URL leaves that capability out
/// of the dependency bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    staking_url: String,
    order_book_url: String,
    meta_txn_url: Option<String>,
    swap_url: Option<String>,
    event_bus_url: Option<String>,
    request_timeout: Duration,
}

impl UpstreamConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            staking_url: get_required_var("STAKING_SERVICE_URL")?,
            order_book_url: get_required_var("ORDER_BOOK_SERVICE_URL")?,
            meta_txn_url: get_optional_var("META_TXN_SERVICE_URL"),
            swap_url: get_optional_var("SWAP_SERVICE_URL"),
            event_bus_url: get_optional_var("EVENT_BUS_URL"),
            request_timeout: Duration::from_millis(parse_or(
                "UPSTREAM_TIMEOUT_MS",
                DEFAULT_UPSTREAM_TIMEOUT_MS,
            )?),
        })
    }

    pub fn staking_url(&self) -> &str {
        &self.staking_url
    }

    pub fn order_book_url(&self) -> &str {
        &self.order_book_url
    }

    pub fn meta_txn_url(&self) -> Option<&str> {
        self.meta_txn_url.as_deref()
    }

    pub fn swap_url(&self) -> Option<&str> {
        self.swap_url.as_deref()
    }

    pub fn event_bus_url(&self) -> Option<&str> {
        self.event_bus_url.as_deref()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("GATEWAY_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("unknown meta transaction rate limit strategy `{tag}`")]
    UnknownRateLimitStrategy { tag: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
