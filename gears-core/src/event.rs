//! Observer lists made of owned closures.
//!
//! Subscribing hands back a [`Subscription`]; dropping it (or calling
//! [`Subscription::cancel`]) removes the closure. An `Event` never stores a
//! pointer to its observers, so detaching an observer can not leave a dangling
//! entry behind.

use std::fmt;
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use crate::collections::hashset::HashSet;

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Listener<T> {
    id: u64,
    callback: Callback<T>,
}

struct Listeners<T> {
    next_id: u64,
    entries: Vec<Listener<T>>,
    // ids removed while a notification was running
    cancelled: HashSet<u64>,
    notify_depth: u32,
}

impl<T> Listeners<T> {
    fn remove(&mut self, id: u64) {
        if self.notify_depth > 0 {
            self.cancelled.insert(id);
        }
        self.entries.retain(|listener| listener.id != id);
    }
}

/// A list of callbacks invoked with `&T` on every [`Event::notify`].
pub struct Event<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
                cancelled: HashSet::default(),
                notify_depth: 0,
            })),
        }
    }

    /// Register `callback`. It stays registered while the returned handle lives.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&T) + Send + 'static,
    {
        let id = {
            let mut listeners = self.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push(Listener { id, callback: Box::new(callback) });
            id
        };

        let weak: Weak<Mutex<Listeners<T>>> = Arc::downgrade(&self.listeners);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners.lock().remove(id);
                }
            })),
        }
    }

    /// Invoke every registered callback in subscription order.
    ///
    /// Callbacks may subscribe or cancel while being notified; new subscribers
    /// are first called on the next notification.
    pub fn notify(&self, args: &T) {
        let mut active = {
            let mut listeners = self.listeners.lock();
            listeners.notify_depth += 1;
            std::mem::take(&mut listeners.entries)
        };

        for listener in active.iter_mut() {
            if self.listeners.lock().cancelled.contains(&listener.id) {
                continue;
            }
            (listener.callback)(args);
        }

        let mut listeners = self.listeners.lock();
        listeners.notify_depth -= 1;
        active.retain(|listener| !listeners.cancelled.contains(&listener.id));
        active.append(&mut listeners.entries);
        listeners.entries = active;
        if listeners.notify_depth == 0 {
            listeners.cancelled.clear();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("listeners", &self.listeners.lock().entries.len())
            .finish()
    }
}

/// Cancellation token for a callback registered on an [`Event`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the callback now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for the lifetime of the event.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&u32) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        (count, move |_: &u32| { captured.fetch_add(1, Ordering::SeqCst); })
    }

    #[test]
    fn notify_reaches_all_subscribers() {
        let event = Event::<u32>::new();
        let (a, fa) = counter();
        let (b, fb) = counter();
        let _sa = event.subscribe(fa);
        let _sb = event.subscribe(fb);

        event.notify(&1);
        event.notify(&2);

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let event = Event::<u32>::new();
        let (count, f) = counter();
        let sub = event.subscribe(f);
        event.notify(&0);
        drop(sub);
        event.notify(&0);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event.listener_count(), 0);
    }

    #[test]
    fn detached_subscription_stays() {
        let event = Event::<u32>::new();
        let (count, f) = counter();
        event.subscribe(f).detach();
        event.notify(&0);
        event.notify(&0);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscription_outliving_event_is_harmless() {
        let (_, f) = counter();
        let sub = {
            let event = Event::<u32>::new();
            event.subscribe(f)
        };
        sub.cancel();
    }

    #[test]
    fn cancel_during_notify_skips_later_listener() {
        let event = Event::<u32>::new();
        let (count, f) = counter();

        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let killer = victim.clone();
        let _first = event.subscribe(move |_| {
            if let Some(sub) = killer.lock().take() {
                sub.cancel();
            }
        });
        *victim.lock() = Some(event.subscribe(f));

        event.notify(&0);
        event.notify(&0);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(event.listener_count(), 1);
    }

    #[test]
    fn subscribe_during_notify_is_deferred() {
        let event = Arc::new(Event::<u32>::new());
        let (count, f) = counter();
        let pending = Arc::new(Mutex::new(Some(f)));
        let keep: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let inner_event = event.clone();
        let inner_keep = keep.clone();
        let _outer = event.subscribe(move |_| {
            if let Some(f) = pending.lock().take() {
                inner_keep.lock().push(inner_event.subscribe(f));
            }
        });

        event.notify(&0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        event.notify(&0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event.listener_count(), 2);
    }
}
