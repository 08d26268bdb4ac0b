//! Listener sets with detach-safe notification.
//!
//! A notify pass snapshots the registered callbacks and then invokes them
//! with no lock held. Before each invocation the listener's membership is
//! checked again, so a callback may detach itself or any other listener
//! mid-pass and a detached listener is never called afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Callback invoked on every notify.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ListenerSetInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl ListenerSetInner {
    fn contains(&self, id: u64) -> bool {
        self.listeners.lock().iter().any(|(i, _)| *i == id)
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id);
        listeners.len() != before
    }
}

/// A set of callbacks notified together.
///
/// Cloning is cheap and shares the same set.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<ListenerSetInner>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    pub fn add(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        Subscription {
            set: Arc::downgrade(&self.inner),
            id,
            active: true,
        }
    }

    /// Invoke every registered callback in registration order.
    pub fn notify(&self) {
        let snapshot: Vec<(u64, Listener)> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in snapshot {
            if self.inner.contains(id) {
                listener();
            }
        }
    }

    /// Detach every callback. Outstanding subscriptions become inert.
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.listeners.lock().is_empty()
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listener_count", &self.len())
            .finish()
    }
}

/// Detach handle for one registered callback.
///
/// Dropping it detaches the callback as well.
#[must_use = "dropping a Subscription detaches its listener immediately"]
pub struct Subscription {
    set: Weak<ListenerSetInner>,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Detach the callback. Returns `true` if it was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.detach()
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.active
            && self
                .set
                .upgrade()
                .is_some_and(|inner| inner.contains(self.id))
    }

    fn detach(&mut self) -> bool {
        if !std::mem::replace(&mut self.active, false) {
            return false;
        }
        self.set
            .upgrade()
            .is_some_and(|inner| inner.remove(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_notify_reaches_all_listeners() {
        let set = ListenerSet::new();
        let (a, fa) = counter();
        let (b, fb) = counter();
        let _sa = set.add(fa);
        let _sb = set.add(fb);

        set.notify();
        set.notify();

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let set = ListenerSet::new();
        let (count, f) = counter();
        let sub = set.add(f);

        set.notify();
        assert!(sub.unsubscribe());
        set.notify();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_drop_detaches() {
        let set = ListenerSet::new();
        let (count, f) = counter();
        drop(set.add(f));

        set.notify();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_detach_itself_during_notify() {
        let set = ListenerSet::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (count, f) = counter();

        let s = Arc::clone(&slot);
        let sub = set.add(move || {
            f();
            if let Some(sub) = s.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        set.notify();
        set.notify();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_listener_detached_mid_pass_is_skipped() {
        let set = ListenerSet::new();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (count, f) = counter();

        let v = Arc::clone(&victim);
        let _first = set.add(move || {
            if let Some(sub) = v.lock().take() {
                sub.unsubscribe();
            }
        });
        *victim.lock() = Some(set.add(f));

        set.notify();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_clear_makes_subscriptions_inert() {
        let set = ListenerSet::new();
        let (_, f) = counter();
        let sub = set.add(f);

        set.clear();
        assert!(!sub.is_active());
        assert!(!sub.unsubscribe());
    }
}
