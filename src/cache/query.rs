//! Per-key fetch state machine.
//!
//! A query moves `pending -> success | error` inside [`Query::fetch`] and
//! nowhere else. The `is_fetching` flag is checked and set under the state
//! lock, so concurrent fetches run the fetch function once per cycle.
//! Observers hear exactly two notifications per cycle: one when it starts
//! and one when it settles.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::{QueryDigest, QueryFn, QueryKey, QueryOptions};
use crate::listeners::{ListenerSet, Subscription};

/// Where a query is in its fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

/// Raw state held by a query.
pub struct QueryState<T, E> {
    pub status: QueryStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<E>>,
    pub is_fetching: bool,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub error_updated_at: Option<DateTime<Utc>>,
    /// Fetch cycles started so far. Deduplicated calls are not counted.
    pub fetch_count: u64,
}

impl<T, E> QueryState<T, E> {
    fn new() -> Self {
        Self {
            status: QueryStatus::Pending,
            data: None,
            error: None,
            is_fetching: false,
            data_updated_at: None,
            error_updated_at: None,
            fetch_count: 0,
        }
    }
}

impl<T, E> Clone for QueryState<T, E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_fetching: self.is_fetching,
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            fetch_count: self.fetch_count,
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for QueryState<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_fetching", &self.is_fetching)
            .field("fetch_count", &self.fetch_count)
            .finish()
    }
}

/// Derived view of a query, handed to consumers.
///
/// [`Query::get_result`] keeps returning the same `Arc` until one of these
/// fields changes, so consumers can compare snapshots with `Arc::ptr_eq`.
pub struct QueryResult<T, E> {
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<E>>,
    pub status: QueryStatus,
    pub is_loading: bool,
    pub is_error: bool,
    pub is_success: bool,
    pub is_fetching: bool,
    pub data_updated_at: Option<DateTime<Utc>>,
    query: Weak<QueryInner<T, E>>,
}

impl<T, E> QueryResult<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Start another fetch of the query this snapshot came from.
    pub async fn refetch(&self) {
        if let Some(inner) = self.query.upgrade() {
            Query { inner }.fetch().await;
        }
    }
}

impl<T, E> QueryResult<T, E> {
    fn from_state(state: &QueryState<T, E>, query: Weak<QueryInner<T, E>>) -> Self {
        Self {
            data: state.data.clone(),
            error: state.error.clone(),
            status: state.status,
            is_loading: state.status == QueryStatus::Pending,
            is_error: state.status == QueryStatus::Error,
            is_success: state.status == QueryStatus::Success,
            is_fetching: state.is_fetching,
            data_updated_at: state.data_updated_at,
            query,
        }
    }

    /// Field-wise comparison; payloads compare by identity.
    fn same_as(&self, other: &Self) -> bool {
        same_arc(&self.data, &other.data)
            && same_arc(&self.error, &other.error)
            && self.status == other.status
            && self.is_fetching == other.is_fetching
            && self.data_updated_at == other.data_updated_at
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for QueryResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("status", &self.status)
            .field("is_fetching", &self.is_fetching)
            .finish_non_exhaustive()
    }
}

fn same_arc<X>(a: &Option<Arc<X>>, b: &Option<Arc<X>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

struct Snapshot<T, E> {
    current: Option<Arc<QueryResult<T, E>>>,
    stale: bool,
}

struct QueryInner<T, E> {
    key: QueryKey,
    digest: QueryDigest,
    fetch_fn: QueryFn<T, E>,
    stale_time: Option<Duration>,
    cache_time: Option<Duration>,
    state: Mutex<QueryState<T, E>>,
    snapshot: Mutex<Snapshot<T, E>>,
    observers: ListenerSet,
}

/// Cached state for one key. Cloning yields another handle to the same query.
pub struct Query<T, E = anyhow::Error> {
    inner: Arc<QueryInner<T, E>>,
}

impl<T, E> Clone for Query<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Query<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a detached query. Register it with [`QueryCache::add`] to share it.
    ///
    /// [`QueryCache::add`]: super::QueryCache::add
    pub fn new(options: QueryOptions<T, E>) -> Self {
        let digest = options.key.digest();
        Self::with_digest(digest, options)
    }

    pub(crate) fn with_digest(digest: QueryDigest, options: QueryOptions<T, E>) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                key: options.key,
                digest,
                fetch_fn: options.fetch_fn,
                stale_time: options.stale_time,
                cache_time: options.cache_time,
                state: Mutex::new(QueryState::new()),
                snapshot: Mutex::new(Snapshot {
                    current: None,
                    stale: true,
                }),
                observers: ListenerSet::new(),
            }),
        }
    }

    /// Run one fetch cycle and wait for it to settle.
    ///
    /// Returns at once, without notifying anyone, if a cycle is already in
    /// flight. Failures land in the query state and are never returned.
    /// Inside a tokio runtime the cycle runs as its own task, so dropping
    /// this future does not abandon it.
    pub async fn fetch(&self) {
        let fetch_fn = {
            let mut state = self.inner.state.lock();
            if state.is_fetching {
                trace!("Query {} already fetching, skipping", self.inner.digest);
                return;
            }
            state.is_fetching = true;
            state.status = QueryStatus::Pending;
            state.error = None;
            state.fetch_count += 1;
            Arc::clone(&self.inner.fetch_fn)
        };

        debug!("Fetching query {}", self.inner.digest);
        self.notify();

        let guard = CycleGuard {
            query: Some(self.clone()),
        };
        let cycle = async move {
            let outcome = fetch_fn().await;
            guard.settle(outcome);
        };

        match Handle::try_current() {
            Ok(handle) => {
                if let Err(e) = handle.spawn(cycle).await {
                    warn!("Fetch task for query {} failed: {}", self.inner.digest, e);
                }
            }
            Err(_) => cycle.await,
        }
    }

    /// Current snapshot, reused while nothing observable has changed.
    pub fn get_result(&self) -> Arc<QueryResult<T, E>> {
        let state = self.inner.state.lock();
        let mut snapshot = self.inner.snapshot.lock();

        if !snapshot.stale {
            if let Some(current) = &snapshot.current {
                return Arc::clone(current);
            }
        }

        let next = QueryResult::from_state(&state, Arc::downgrade(&self.inner));
        let result = match &snapshot.current {
            Some(previous) if previous.same_as(&next) => Arc::clone(previous),
            _ => Arc::new(next),
        };

        snapshot.current = Some(Arc::clone(&result));
        snapshot.stale = false;
        result
    }
}

impl<T, E> Query<T, E> {
    /// Register a callback invoked on every state change.
    pub fn add_observer(&self, observer: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.observers.add(observer)
    }

    fn settle(&self, outcome: Result<T, E>) {
        {
            let mut state = self.inner.state.lock();
            let now = Utc::now();
            match outcome {
                Ok(data) => {
                    state.data = Some(Arc::new(data));
                    state.status = QueryStatus::Success;
                    state.error = None;
                    state.data_updated_at = Some(now);
                }
                Err(error) => {
                    state.error = Some(Arc::new(error));
                    state.status = QueryStatus::Error;
                    state.error_updated_at = Some(now);
                }
            }
            state.is_fetching = false;
        }

        debug!(
            "Query {} settled with status {:?}",
            self.inner.digest,
            self.status()
        );
        self.notify();
    }

    /// Close a cycle that ended without an outcome, e.g. because the fetch
    /// function panicked. Data from earlier cycles is kept.
    fn abandon(&self) {
        {
            let mut state = self.inner.state.lock();
            state.is_fetching = false;
            if state.data.is_some() {
                state.status = QueryStatus::Success;
            }
        }

        warn!("Fetch cycle for query {} ended without an outcome", self.inner.digest);
        self.notify();
    }

    fn notify(&self) {
        self.inner.snapshot.lock().stale = true;
        self.inner.observers.notify();
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn digest(&self) -> &QueryDigest {
        &self.inner.digest
    }

    pub fn stale_time(&self) -> Option<Duration> {
        self.inner.stale_time
    }

    pub fn cache_time(&self) -> Option<Duration> {
        self.inner.cache_time
    }

    pub fn state(&self) -> QueryState<T, E> {
        self.inner.state.lock().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.state.lock().status
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.state.lock().is_fetching
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Whether both handles point at the same query.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Settles a fetch cycle exactly once, even if the cycle unwinds or is dropped.
struct CycleGuard<T, E> {
    query: Option<Query<T, E>>,
}

impl<T, E> CycleGuard<T, E> {
    fn settle(mut self, outcome: Result<T, E>) {
        if let Some(query) = self.query.take() {
            query.settle(outcome);
        }
    }
}

impl<T, E> Drop for CycleGuard<T, E> {
    fn drop(&mut self) {
        if let Some(query) = self.query.take() {
            query.abandon();
        }
    }
}

impl<T, E> fmt::Debug for Query<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Query")
            .field("digest", &self.inner.digest)
            .field("status", &state.status)
            .field("is_fetching", &state.is_fetching)
            .field("observer_count", &self.inner.observers.len())
            .finish()
    }
}
