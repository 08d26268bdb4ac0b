//! Mutation controller - unkeyed state machine for one-shot writes.
//!
//! ```text
//! idle --mutate--> pending --ok--> success
//!                          --err-> error
//! any --reset--> idle
//! ```
//!
//! Calls are not deduplicated: overlapping mutations each run, and the last
//! one to settle owns the shared state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::listeners::{ListenerSet, Subscription};

/// Shared, type-erased mutation function.
pub type MutationFn<T, E, V> =
    Arc<dyn Fn(V) -> BoxFuture<'static, std::result::Result<T, E>> + Send + Sync>;

type SuccessHook<T, V> = Arc<dyn Fn(&T, &V) + Send + Sync>;
type ErrorHook<E, V> = Arc<dyn Fn(&E, &V) + Send + Sync>;
type SettledHook<T, E, V> = Arc<dyn Fn(Option<&T>, Option<&E>, &V) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// Observable state of a mutation controller.
pub struct MutationState<T, E> {
    pub status: MutationStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<E>>,
}

impl<T, E> MutationState<T, E> {
    fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

impl<T, E> Clone for MutationState<T, E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for MutationState<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationState")
            .field("status", &self.status)
            .field("data", &self.data)
            .field("error", &self.error)
            .finish()
    }
}

/// The write to perform and the hooks to run when it settles.
pub struct MutationOptions<T, E, V> {
    pub mutation_fn: MutationFn<T, E, V>,
    pub on_success: Option<SuccessHook<T, V>>,
    pub on_error: Option<ErrorHook<E, V>>,
    pub on_settled: Option<SettledHook<T, E, V>>,
}

impl<T, E, V> MutationOptions<T, E, V> {
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    #[must_use]
    pub fn on_success(mut self, hook: impl Fn(&T, &V) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&E, &V) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_settled(
        mut self,
        hook: impl Fn(Option<&T>, Option<&E>, &V) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(hook));
        self
    }
}

struct MutationInner<T, E, V> {
    options: MutationOptions<T, E, V>,
    state: Mutex<MutationState<T, E>>,
    listeners: ListenerSet,
}

/// Runs mutations and tracks the state of the latest one to settle.
///
/// Cloning is cheap and shares the same state.
pub struct MutationController<T, E = anyhow::Error, V = ()> {
    inner: Arc<MutationInner<T, E, V>>,
}

impl<T, E, V> Clone for MutationController<T, E, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E, V> MutationController<T, E, V>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: MutationOptions<T, E, V>) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                options,
                state: Mutex::new(MutationState::idle()),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Run the mutation and hand its outcome back.
    ///
    /// Hooks run after the state is updated: `on_success` or `on_error`
    /// first, then `on_settled`. Inside a tokio runtime the mutation runs as
    /// its own task, so dropping this future does not abandon it.
    pub async fn mutate_async(&self, variables: V) -> std::result::Result<Arc<T>, Arc<E>> {
        let run = self.clone().run(variables);
        match Handle::try_current() {
            Ok(handle) => match handle.spawn(run).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    // Cancelled only while the runtime shuts down, which drops
                    // the calling task as well.
                    warn!("Mutation task cancelled: {}", e);
                    futures::future::pending().await
                }
            },
            Err(_) => run.await,
        }
    }

    /// Run the mutation in the background, ignoring its outcome here.
    ///
    /// State and hooks still see the result.
    pub fn mutate(&self, variables: V) -> Result<JoinHandle<()>> {
        let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        let run = self.clone().run(variables);
        Ok(handle.spawn(async move {
            let _ = run.await;
        }))
    }

    async fn run(self, variables: V) -> std::result::Result<Arc<T>, Arc<E>> {
        self.update(|state| {
            state.status = MutationStatus::Pending;
            state.error = None;
        });
        debug!("Mutation started");

        let guard = PendingGuard {
            controller: Some(self.clone()),
        };
        let outcome = (self.inner.options.mutation_fn)(variables.clone()).await;
        guard.disarm();
        let options = &self.inner.options;

        match outcome {
            Ok(data) => {
                let data = Arc::new(data);
                self.update(|state| {
                    state.data = Some(Arc::clone(&data));
                    state.status = MutationStatus::Success;
                });
                debug!("Mutation succeeded");

                if let Some(hook) = &options.on_success {
                    hook(&*data, &variables);
                }
                if let Some(hook) = &options.on_settled {
                    hook(Some(&*data), None, &variables);
                }
                Ok(data)
            }
            Err(error) => {
                let error = Arc::new(error);
                self.update(|state| {
                    state.error = Some(Arc::clone(&error));
                    state.status = MutationStatus::Error;
                });
                debug!("Mutation failed");

                if let Some(hook) = &options.on_error {
                    hook(&*error, &variables);
                }
                if let Some(hook) = &options.on_settled {
                    hook(None, Some(&*error), &variables);
                }
                Err(error)
            }
        }
    }
}

/// Returns the controller to idle if a mutation ends without an outcome.
struct PendingGuard<T, E, V> {
    controller: Option<MutationController<T, E, V>>,
}

impl<T, E, V> PendingGuard<T, E, V> {
    fn disarm(mut self) {
        self.controller = None;
    }
}

impl<T, E, V> Drop for PendingGuard<T, E, V> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            warn!("Mutation ended without an outcome, resetting");
            controller.reset();
        }
    }
}

impl<T, E, V> MutationController<T, E, V> {
    fn update(&self, apply: impl FnOnce(&mut MutationState<T, E>)) {
        {
            let mut state = self.inner.state.lock();
            apply(&mut *state);
        }
        self.inner.listeners.notify();
    }

    /// Return to idle and forget data and error.
    pub fn reset(&self) {
        self.update(|state| *state = MutationState::idle());
    }

    /// Register a listener for state changes.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.add(listener)
    }

    pub fn state(&self) -> MutationState<T, E> {
        self.inner.state.lock().clone()
    }

    pub fn status(&self) -> MutationStatus {
        self.inner.state.lock().status
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.state.lock().data.clone()
    }

    pub fn error(&self) -> Option<Arc<E>> {
        self.inner.state.lock().error.clone()
    }
}

impl<T, E, V> fmt::Debug for MutationController<T, E, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationController")
            .field("status", &self.inner.state.lock().status)
            .field("listener_count", &self.inner.listeners.len())
            .finish()
    }
}
