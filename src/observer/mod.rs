//! Query observer - binds one consumer to one query.
//!
//! The observer forwards its query's notifications to the consumer's own
//! listeners, rebinds when the consumer's key changes, and gates fetching
//! on the `enabled` option.
//!
//! ```text
//! Unbound --new--> Bound(A) --set_options(new digest)--> Bound(B)
//!                  Bound(*) --destroy--> Unbound (terminal)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cache::{Query, QueryDigest, QueryOptions, QueryResult};
use crate::client::QueryClient;
use crate::error::{CacheError, Result};
use crate::listeners::{ListenerSet, Subscription};

struct ObserverState<T, E> {
    query: Query<T, E>,
    digest: QueryDigest,
    options: QueryOptions<T, E>,
    query_subscription: Option<Subscription>,
    destroyed: bool,
}

struct ObserverInner<T, E> {
    client: QueryClient,
    state: Mutex<ObserverState<T, E>>,
    listeners: ListenerSet,
}

/// Consumer-facing binding to a [`Query`].
///
/// Cloning yields another handle to the same observer.
pub struct QueryObserver<T, E = anyhow::Error> {
    inner: Arc<ObserverInner<T, E>>,
}

impl<T, E> Clone for QueryObserver<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> QueryObserver<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Resolve the query for `options` and start forwarding its notifications.
    pub fn new(client: &QueryClient, options: QueryOptions<T, E>) -> Result<Self> {
        let options = client.default_options(options);
        let query = client.query_cache().build(&options)?;
        let digest = query.digest().clone();

        let observer = Self {
            inner: Arc::new(ObserverInner {
                client: client.clone(),
                state: Mutex::new(ObserverState {
                    query,
                    digest,
                    options,
                    query_subscription: None,
                    destroyed: false,
                }),
                listeners: ListenerSet::new(),
            }),
        };
        observer.subscribe_to_query();
        Ok(observer)
    }

    /// Snapshot of the query `options` resolve to, which need not be the
    /// bound one. Used to render before subscriptions are in place.
    pub fn get_optimistic_result(
        &self,
        options: &QueryOptions<T, E>,
    ) -> Result<Arc<QueryResult<T, E>>> {
        let options = self.inner.client.default_options(options.clone());
        let query = self.inner.client.query_cache().build(&options)?;
        Ok(query.get_result())
    }

    /// Snapshot of the bound query.
    pub fn get_current_result(&self) -> Arc<QueryResult<T, E>> {
        self.query().get_result()
    }

    /// Apply new options, rebinding if the key's digest changed.
    ///
    /// Listeners are notified either way. A destroyed observer ignores the
    /// call and registers nothing in the cache.
    pub fn set_options(&self, options: QueryOptions<T, E>) -> Result<()> {
        let options = self.inner.client.default_options(options);
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                trace!("Observer for {} is destroyed, ignoring new options", state.digest);
                return Ok(());
            }

            let digest = options.key.digest();
            if digest != state.digest {
                let query = self.inner.client.query_cache().build(&options)?;
                debug!("Observer rebinding from {} to {}", state.digest, digest);

                state.query_subscription = None;
                state.query = query;
                state.digest = digest;
                self.attach(&mut *state);
            }
            state.options = options;
        }

        self.inner.listeners.notify();
        Ok(())
    }

    /// Fetch the bound query unless the observer is disabled.
    pub async fn fetch_optimistic(&self) {
        if let Some(query) = self.enabled_query() {
            query.fetch().await;
        }
    }

    /// Like [`fetch_optimistic`](Self::fetch_optimistic) without waiting.
    ///
    /// Returns `Ok(None)` if the observer is disabled.
    pub fn spawn_fetch(&self) -> Result<Option<JoinHandle<()>>> {
        let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        Ok(self
            .enabled_query()
            .map(|query| handle.spawn(async move { query.fetch().await })))
    }

    fn enabled_query(&self) -> Option<Query<T, E>> {
        let state = self.inner.state.lock();
        if state.options.is_enabled() {
            Some(state.query.clone())
        } else {
            trace!("Observer for {} is disabled, not fetching", state.digest);
            None
        }
    }
}

impl<T, E> QueryObserver<T, E> {
    /// Register the consumer's change listener.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.add(listener)
    }

    /// (Re)establish forwarding from the bound query to this observer's
    /// listeners. Replaces any existing forwarding; no-op once destroyed.
    pub fn subscribe_to_query(&self) {
        let mut state = self.inner.state.lock();
        if !state.destroyed {
            self.attach(&mut *state);
        }
    }

    fn attach(&self, state: &mut ObserverState<T, E>) {
        let listeners = self.inner.listeners.clone();
        state.query_subscription = Some(state.query.add_observer(move || listeners.notify()));
    }

    /// Detach from the bound query and drop every listener. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.query_subscription = None;
        self.inner.listeners.clear();
        debug!("Observer for {} destroyed", state.digest);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// The query this observer is bound to.
    pub fn query(&self) -> Query<T, E> {
        self.inner.state.lock().query.clone()
    }

    /// Options as last applied, with client defaults filled in.
    pub fn options(&self) -> QueryOptions<T, E> {
        self.inner.state.lock().options.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl<T, E> std::fmt::Debug for QueryObserver<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("QueryObserver")
            .field("digest", &state.digest)
            .field("subscribed", &state.query_subscription.is_some())
            .field("destroyed", &state.destroyed)
            .field("listener_count", &self.inner.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::{QueryKey, QueryStatus, query_key};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(key: QueryKey, calls: &Arc<AtomicUsize>) -> QueryOptions<String, String> {
        let calls = Arc::clone(calls);
        let label = key.digest().to_string();
        QueryOptions::new(key, move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let label = label.clone();
            async move { Ok(label) }
        })
    }

    fn counting_listener(observer: &QueryObserver<String, String>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = observer.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[tokio::test]
    async fn test_fetch_reaches_consumer_listener() {
        crate::test_support::init_tracing();
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["post", 1], &calls)).unwrap();
        let (notified, _sub) = counting_listener(&observer);

        observer.fetch_optimistic().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        let result = observer.get_current_result();
        assert_eq!(result.status, QueryStatus::Success);
        assert_eq!(result.data.as_deref().map(String::as_str), Some(r#"["post",1]"#));
    }

    #[tokio::test]
    async fn test_disabled_observer_does_not_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer =
            QueryObserver::new(&client, options(query_key!["off"], &calls).enabled(false)).unwrap();

        observer.fetch_optimistic().await;
        assert!(observer.spawn_fetch().unwrap().is_none());

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(observer.get_current_result().is_loading);
    }

    #[tokio::test]
    async fn test_client_default_disables_fetch() {
        let client = QueryClient::with_config(QueryConfig::default().enabled(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["d"], &calls)).unwrap();

        observer.fetch_optimistic().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        observer
            .set_options(options(query_key!["d"], &calls).enabled(true))
            .unwrap();
        observer.fetch_optimistic().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observers_share_one_query() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = QueryObserver::new(&client, options(query_key!["shared"], &calls)).unwrap();
        let second = QueryObserver::new(&client, options(query_key!["shared"], &calls)).unwrap();
        let (seen_by_second, _sub) = counting_listener(&second);

        assert!(first.query().ptr_eq(&second.query()));
        assert_eq!(first.query().observer_count(), 2);

        first.fetch_optimistic().await;

        assert_eq!(seen_by_second.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(
            &first.get_current_result(),
            &second.get_current_result()
        ));
    }

    #[test]
    fn test_set_options_same_digest_keeps_binding_but_notifies() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["k"], &calls)).unwrap();
        let (notified, _sub) = counting_listener(&observer);
        let before = observer.query();

        observer
            .set_options(options(query_key!["k"], &calls).enabled(false))
            .unwrap();

        assert!(observer.query().ptr_eq(&before));
        assert_eq!(before.observer_count(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(observer.options().enabled, Some(false));
    }

    #[tokio::test]
    async fn test_set_options_new_digest_rebinds() {
        crate::test_support::init_tracing();
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["post", 1], &calls)).unwrap();
        let (notified, _sub) = counting_listener(&observer);
        let old = observer.query();

        observer
            .set_options(options(query_key!["post", 2], &calls))
            .unwrap();
        let new = observer.query();

        assert!(!old.ptr_eq(&new));
        assert_eq!(old.observer_count(), 0);
        assert_eq!(new.observer_count(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        old.fetch().await;
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        observer.fetch_optimistic().await;
        assert_eq!(notified.load(Ordering::SeqCst), 3);
        assert_eq!(
            observer.get_current_result().data.as_deref().map(String::as_str),
            Some(r#"["post",2]"#)
        );
    }

    #[test]
    fn test_optimistic_result_does_not_rebind() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["a"], &calls)).unwrap();

        let other = options(query_key!["b"], &calls);
        let result = observer.get_optimistic_result(&other).unwrap();

        assert!(result.is_loading);
        assert_eq!(observer.query().digest(), &query_key!["a"].digest());
        assert!(client.query_cache().contains(&query_key!["b"].digest()));
    }

    #[test]
    fn test_resubscribe_does_not_double_forward() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["r"], &calls)).unwrap();

        observer.subscribe_to_query();
        observer.subscribe_to_query();

        assert_eq!(observer.query().observer_count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_terminal() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["gone"], &calls)).unwrap();
        let (notified, _sub) = counting_listener(&observer);
        let query = observer.query();

        observer.destroy();
        observer.destroy();

        assert!(observer.is_destroyed());
        assert_eq!(observer.listener_count(), 0);
        assert_eq!(query.observer_count(), 0);

        observer.subscribe_to_query();
        assert_eq!(query.observer_count(), 0);

        query.fetch().await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroyed_observer_ignores_new_options() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["before"], &calls)).unwrap();
        let query = observer.query();
        observer.destroy();

        observer
            .set_options(options(query_key!["after"], &calls))
            .unwrap();

        assert!(observer.query().ptr_eq(&query));
        assert!(!client.query_cache().contains(&query_key!["after"].digest()));
        assert_eq!(client.query_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_survives_observer_teardown() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["t"], &calls)).unwrap();
        let query = observer.query();

        let handle = observer.spawn_fetch().unwrap().unwrap();
        observer.destroy();
        drop(observer);
        handle.await.unwrap();

        assert_eq!(query.status(), QueryStatus::Success);
    }

    #[test]
    fn test_spawn_fetch_needs_runtime() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, options(query_key!["rt"], &calls)).unwrap();

        assert_eq!(observer.spawn_fetch().unwrap_err(), CacheError::NoRuntime);
    }

    #[test]
    fn test_type_mismatch_surfaces_from_new() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _observer = QueryObserver::new(&client, options(query_key!["m"], &calls)).unwrap();

        let err = QueryObserver::<u32, String>::new(
            &client,
            QueryOptions::new(query_key!["m"], || async { Ok(1) }),
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { .. }));
    }
}
