//! Query defaults.
//!
//! Loaded from code or from environment variables.

use std::env;
use std::time::Duration;

use tracing::debug;

use crate::error::{CacheError, Result};

const ENV_ENABLED: &str = "QUERYCACHE_ENABLED";
const ENV_STALE_TIME: &str = "QUERYCACHE_STALE_TIME_MS";
const ENV_CACHE_TIME: &str = "QUERYCACHE_CACHE_TIME_MS";

/// Defaults applied to query options that leave a field unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Whether observers fetch when asked to.
    pub enabled: bool,

    /// How long fetched data counts as fresh.
    /// Recorded on every query but not acted on yet.
    pub stale_time: Option<Duration>,

    /// How long an unobserved query is kept.
    /// Recorded on every query but nothing is evicted.
    pub cache_time: Option<Duration>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: None,
            cache_time: Some(Duration::from_secs(300)), // 5 minutes
        }
    }
}

impl QueryConfig {
    /// Set whether observers fetch by default (builder pattern).
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the default stale time.
    #[must_use]
    pub fn stale_time(mut self, duration: Duration) -> Self {
        self.stale_time = Some(duration);
        self
    }

    /// Set the default cache time.
    #[must_use]
    pub fn cache_time(mut self, duration: Duration) -> Self {
        self.cache_time = Some(duration);
        self
    }

    /// Keep unobserved queries forever.
    #[must_use]
    pub fn no_cache_time(mut self) -> Self {
        self.cache_time = None;
        self
    }

    /// Defaults for data that changes constantly.
    pub fn realtime() -> Self {
        Self {
            enabled: true,
            stale_time: Some(Duration::ZERO),
            cache_time: Some(Duration::from_secs(60)), // 1 minute
        }
    }

    /// Defaults for data that practically never changes.
    pub fn static_data() -> Self {
        Self {
            enabled: true,
            stale_time: Some(Duration::from_secs(3600)), // 1 hour
            cache_time: None,
        }
    }

    /// Load defaults from environment variables, reading `.env` first.
    ///
    /// Unset variables keep their default; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_ENABLED) {
            config.enabled = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(CacheError::Config {
                        var: ENV_ENABLED,
                        value,
                    });
                }
            };
        }

        if let Some(value) = lookup(ENV_STALE_TIME) {
            config.stale_time = Some(parse_millis(ENV_STALE_TIME, value)?);
        }

        if let Some(value) = lookup(ENV_CACHE_TIME) {
            config.cache_time = Some(parse_millis(ENV_CACHE_TIME, value)?);
        }

        debug!("Query defaults loaded: {:?}", config);
        Ok(config)
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| CacheError::Config { var, value })
}
