//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use domain::MissingFieldPolicy;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for pretty output
/// - `DATABASE_URL`: PostgreSQL event store when set, in-memory otherwise
/// - `MISSING_FIELD_POLICY`: `default` or `reject`
/// - `SUMMARY_PAGE_SIZE`: summary scan page size (default: `100`)
/// - `QUERY_TIMEOUT_MS`: deadline for listing summaries (default: `5000`)
/// - `PROJECTION_MAX_ATTEMPTS`: apply attempts before dead-lettering (default: `3`)
/// - `PROJECTION_RETRY_DELAY_MS`: first retry backoff (default: `50`)
/// - `FEED_BATCH_SIZE`: change-feed batch size (default: `100`)
/// - `FEED_POLL_INTERVAL_MS`: idle poll interval (default: `250`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub missing_field_policy: MissingFieldPolicy,
    pub summary_page_size: usize,
    pub query_timeout: Duration,
    pub projection_max_attempts: u32,
    pub projection_retry_delay: Duration,
    pub feed_batch_size: usize,
    pub feed_poll_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: std::env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            missing_field_policy: env_or("MISSING_FIELD_POLICY", defaults.missing_field_policy),
            summary_page_size: env_or("SUMMARY_PAGE_SIZE", defaults.summary_page_size),
            query_timeout: Duration::from_millis(env_or("QUERY_TIMEOUT_MS", 5000)),
            projection_max_attempts: env_or(
                "PROJECTION_MAX_ATTEMPTS",
                defaults.projection_max_attempts,
            ),
            projection_retry_delay: Duration::from_millis(env_or("PROJECTION_RETRY_DELAY_MS", 50)),
            feed_batch_size: env_or("FEED_BATCH_SIZE", defaults.feed_batch_size),
            feed_poll_interval: Duration::from_millis(env_or("FEED_POLL_INTERVAL_MS", 250)),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            missing_field_policy: MissingFieldPolicy::DefaultSentinels,
            summary_page_size: 100,
            query_timeout: Duration::from_millis(5000),
            projection_max_attempts: 3,
            projection_retry_delay: Duration::from_millis(50),
            feed_batch_size: 100,
            feed_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Parses `key` from the environment, keeping `default` when unset or invalid.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}
