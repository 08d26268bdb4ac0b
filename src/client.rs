//! Query client - the long-lived handle consumers share.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cache::{QueryCache, QueryOptions};
use crate::config::QueryConfig;

/// Owns the query cache and the defaults applied to query options.
///
/// Cloning is cheap; clones share the cache, including swaps made through
/// [`set_query_cache`](Self::set_query_cache).
#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<RwLock<QueryCache>>,
    config: Arc<QueryConfig>,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    pub fn with_config(config: QueryConfig) -> Self {
        info!("Query client created");
        Self {
            cache: Arc::new(RwLock::new(QueryCache::new())),
            config: Arc::new(config),
        }
    }

    /// The cache every observer of this client resolves queries through.
    pub fn query_cache(&self) -> QueryCache {
        self.cache.read().clone()
    }

    /// Swap in another cache. Observers pick it up on their next build.
    pub fn set_query_cache(&self, cache: QueryCache) {
        debug!("Replacing query cache");
        *self.cache.write() = cache;
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Fill unset option fields from this client's defaults.
    pub fn default_options<T, E>(&self, mut options: QueryOptions<T, E>) -> QueryOptions<T, E> {
        options.enabled = options.enabled.or(Some(self.config.enabled));
        options.stale_time = options.stale_time.or(self.config.stale_time);
        options.cache_time = options.cache_time.or(self.config.cache_time);
        options
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &*self.cache.read())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use std::time::Duration;

    #[test]
    fn test_clones_share_cache() {
        let client = QueryClient::new();
        let other = client.clone();
        let options = QueryOptions::<u32, String>::new(query_key!["x"], || async { Ok(1) });

        let a = client.query_cache().build(&options).unwrap();
        let b = other.query_cache().build(&options).unwrap();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_set_query_cache_is_seen_by_clones() {
        let client = QueryClient::new();
        let other = client.clone();
        let options = QueryOptions::<u32, String>::new(query_key!["x"], || async { Ok(1) });
        let before = client.query_cache().build(&options).unwrap();

        client.set_query_cache(QueryCache::new());

        let after = other.query_cache().build(&options).unwrap();
        assert!(!before.ptr_eq(&after));
        assert_eq!(other.query_cache().len(), 1);
    }

    #[test]
    fn test_default_options_fill_only_unset_fields() {
        let client = QueryClient::with_config(
            QueryConfig::default()
                .enabled(false)
                .stale_time(Duration::from_secs(10)),
        );

        let filled = client.default_options(QueryOptions::<u32, String>::new(
            query_key!["x"],
            || async { Ok(1) },
        ));
        assert_eq!(filled.enabled, Some(false));
        assert_eq!(filled.stale_time, Some(Duration::from_secs(10)));
        assert_eq!(filled.cache_time, Some(Duration::from_secs(300)));

        let explicit = client.default_options(
            QueryOptions::<u32, String>::new(query_key!["x"], || async { Ok(1) })
                .enabled(true)
                .stale_time(Duration::from_secs(1)),
        );
        assert_eq!(explicit.enabled, Some(true));
        assert_eq!(explicit.stale_time, Some(Duration::from_secs(1)));
    }
}
