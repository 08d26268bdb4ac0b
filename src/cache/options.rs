//! Per-query options.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::QueryKey;

/// Future produced by a fetch function.
pub type QueryFuture<T, E> = BoxFuture<'static, Result<T, E>>;

/// Shared, type-erased fetch function.
pub type QueryFn<T, E> = Arc<dyn Fn() -> QueryFuture<T, E> + Send + Sync>;

/// What to fetch for a key, and how observers treat it.
pub struct QueryOptions<T, E = anyhow::Error> {
    pub key: QueryKey,
    pub fetch_fn: QueryFn<T, E>,

    /// `None` defers to the client's defaults.
    pub enabled: Option<bool>,

    /// Freshness window. Stored on the query, not acted on yet.
    pub stale_time: Option<Duration>,

    /// Retention window for unobserved queries. Stored, nothing is evicted.
    pub cache_time: Option<Duration>,
}

impl<T, E> QueryOptions<T, E> {
    pub fn new<F, Fut>(key: QueryKey, fetch_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            key,
            fetch_fn: Arc::new(move || fetch_fn().boxed()),
            enabled: None,
            stale_time: None,
            cache_time: None,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn stale_time(mut self, duration: Duration) -> Self {
        self.stale_time = Some(duration);
        self
    }

    #[must_use]
    pub fn cache_time(mut self, duration: Duration) -> Self {
        self.cache_time = Some(duration);
        self
    }

    /// Anything but an explicit `false` counts as enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}

impl<T, E> Clone for QueryOptions<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetch_fn: Arc::clone(&self.fetch_fn),
            enabled: self.enabled,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
        }
    }
}

impl<T, E> fmt::Debug for QueryOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .finish_non_exhaustive()
    }
}
