#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::time::Duration;

/// Upstream attempts per client connection before giving up.
pub const MAX_RETRIES: usize = 3;

/// Accepted clock skew between client timestamp and server wall clock.
pub const AUTH_WINDOW_SECS: i64 = 300;

/// Cap on a client header block and on upstream handshake responses.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Chunk size used while accumulating the client header block.
pub const HEADER_READ_CHUNK: usize = 8 * 1024;

/// Service configuration resolved from `PG_*` environment variables.
///
/// Every field has a default so the proxy starts with zero configuration;
/// unparseable values silently fall back to their default, the same
/// tolerance the rest of the hot path applies to bad input.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC key for request authentication.
    pub secret: Vec<u8>,
    /// Inbound CONNECT listener port.
    pub proxy_port: u16,
    /// Operator HTTP listener port.
    pub metrics_port: u16,
    /// Dial and per-read ceiling on the upstream side.
    pub connect_timeout: Duration,
    /// Relay read chunk size.
    pub buffer_size: usize,
    /// One sample log per N established tunnels.
    pub log_sample_rate: u64,
    /// Probe cadence for the health loop.
    pub health_check_interval: Duration,
    /// Sticky affinity window in seconds; 0 disables stickiness.
    pub sticky_ttl_secs: u64,
    /// Upstream URLs from the environment, in order.
    pub upstream_list: Vec<String>,
    /// Optional upstream file, hot-reloaded on mtime advance.
    pub upstream_file: Option<PathBuf>,
    /// Toggle for HMAC authentication of clients.
    pub enable_auth: bool,
    /// Latency threshold below which an upstream counts as "fast".
    pub max_latency_ms: i64,
    /// Active tunnel count above which selection spreads over all healthy.
    pub high_usage_threshold: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: b"change-this-to-a-high-entropy-string".to_vec(),
            proxy_port: 8888,
            metrics_port: 9090,
            connect_timeout: Duration::from_secs(10),
            buffer_size: 65536,
            log_sample_rate: 1000,
            health_check_interval: Duration::from_secs(60),
            sticky_ttl_secs: 0,
            upstream_list: Vec::new(),
            upstream_file: Some(PathBuf::from("proxies.txt")),
            enable_auth: true,
            max_latency_ms: 500,
            high_usage_threshold: 50,
        }
    }
}

impl Config {
    /// Resolve the full configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let upstream_list = std::env::var("PG_PROXY_LIST")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let upstream_file = match std::env::var("PG_PROXY_FILE") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => defaults.upstream_file,
        };

        Self {
            secret: std::env::var("PG_SECRET")
                .map(|v| v.into_bytes())
                .unwrap_or(defaults.secret),
            proxy_port: env_parse("PROXY_PORT", defaults.proxy_port),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port),
            connect_timeout: Duration::from_secs(env_parse(
                "PG_CONNECT_TIMEOUT",
                defaults.connect_timeout.as_secs(),
            )),
            buffer_size: env_parse("PG_BUFFER_SIZE", defaults.buffer_size),
            log_sample_rate: env_parse("PG_LOG_SAMPLE_RATE", defaults.log_sample_rate),
            health_check_interval: Duration::from_secs(env_parse(
                "PG_HEALTH_CHECK_INTERVAL",
                defaults.health_check_interval.as_secs(),
            )),
            sticky_ttl_secs: env_parse("PG_STICKY_TTL", defaults.sticky_ttl_secs),
            upstream_list,
            upstream_file,
            enable_auth: std::env::var("PG_ENABLE_AUTH")
                .map(|v| v.to_ascii_lowercase() == "true")
                .unwrap_or(defaults.enable_auth),
            max_latency_ms: env_parse("PG_MAX_LATENCY", defaults.max_latency_ms),
            high_usage_threshold: env_parse(
                "PG_HIGH_USAGE_THRESHOLD",
                defaults.high_usage_threshold,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
