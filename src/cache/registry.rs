//! Query cache - digest to query registry.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use super::{Query, QueryDigest, QueryOptions};
use crate::error::{CacheError, Result};

/// Registry holding exactly one [`Query`] per digest.
///
/// Queries are created lazily by [`build`](Self::build) and never replaced
/// or removed. Cloning is cheap and shares the same registry.
///
/// ## Example
///
/// ```
/// use querycache::{QueryCache, QueryOptions, query_key};
///
/// let cache = QueryCache::new();
/// let a = cache
///     .build(&QueryOptions::<u32, String>::new(query_key!["post", 1], || async { Ok(1) }))
///     .unwrap();
/// let b = cache
///     .build(&QueryOptions::<u32, String>::new(query_key!["post", 1], || async { Ok(2) }))
///     .unwrap();
/// assert!(a.ptr_eq(&b));
/// ```
#[derive(Clone)]
pub struct QueryCache {
    queries: Arc<DashMap<QueryDigest, RegisteredQuery>>,
}

/// Internal entry storing a type-erased query.
struct RegisteredQuery {
    query: Box<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl RegisteredQuery {
    fn new<T, E>(query: Query<T, E>) -> Self
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Self {
            query: Box::new(query),
            type_id: TypeId::of::<Query<T, E>>(),
            type_name: std::any::type_name::<Query<T, E>>(),
        }
    }

    fn downcast<T, E>(&self, digest: &QueryDigest) -> Result<Query<T, E>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.query
            .downcast_ref::<Query<T, E>>()
            .filter(|_| self.type_id == TypeId::of::<Query<T, E>>())
            .cloned()
            .ok_or_else(|| CacheError::TypeMismatch {
                digest: digest.clone(),
                expected: std::any::type_name::<Query<T, E>>(),
                found: self.type_name,
            })
    }
}

impl QueryCache {
    /// Create a new empty query cache.
    pub fn new() -> Self {
        info!("Query cache initialized");
        Self {
            queries: Arc::new(DashMap::new()),
        }
    }

    /// Look up the query registered under `digest`.
    ///
    /// Returns `Ok(None)` if nothing is registered, and an error if the
    /// registered query has different types.
    pub fn get<T, E>(&self, digest: &QueryDigest) -> Result<Option<Query<T, E>>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.queries
            .get(digest)
            .map(|entry| entry.downcast(digest))
            .transpose()
    }

    /// Register `query` unless its digest is already taken.
    ///
    /// Returns `true` if the query was inserted.
    pub fn add<T, E>(&self, query: Query<T, E>) -> bool
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        match self.queries.entry(query.digest().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!("Registered query: {}", query.digest());
                slot.insert(RegisteredQuery::new(query));
                true
            }
        }
    }

    /// Get the query for `options.key`, creating it on first use.
    ///
    /// Structurally equal keys always yield the same query instance. The
    /// fetch function of the first build wins.
    pub fn build<T, E>(&self, options: &QueryOptions<T, E>) -> Result<Query<T, E>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let digest = options.key.digest();

        match self.queries.entry(digest.clone()) {
            Entry::Occupied(entry) => entry.get().downcast(&digest),
            Entry::Vacant(slot) => {
                debug!("Creating query: {}", digest);
                let query = Query::with_digest(digest, options.clone());
                slot.insert(RegisteredQuery::new(query.clone()));
                Ok(query)
            }
        }
    }

    /// Check if a query is registered under `digest`.
    pub fn contains(&self, digest: &QueryDigest) -> bool {
        self.queries.contains_key(digest)
    }

    /// Get the number of registered queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Get every registered digest, in no particular order.
    pub fn digests(&self) -> Vec<QueryDigest> {
        self.queries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("query_count", &self.queries.len())
            .finish()
    }
}
