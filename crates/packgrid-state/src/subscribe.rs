//! Synchronous observer lists with RAII unsubscribe handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerSet<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

/// An ordered list of listeners for events of type `E`.
pub struct Subscribers<E> {
    set: Arc<ListenerSet<E>>,
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            set: Arc::new(ListenerSet {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
        self.set.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<ListenerSet<E>> = Arc::downgrade(&self.set);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(set) = weak.upgrade() {
                    set.listeners.lock().retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Invoke every listener in subscription order.
    ///
    /// The list is snapshotted first so listeners may subscribe or
    /// unsubscribe from inside a callback.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .set
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.set.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_fire_in_order_until_dropped() {
        let subs: Subscribers<u32> = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            subs.subscribe(move |e| seen.lock().push(("a", *e)))
        };
        let b = {
            let seen = seen.clone();
            subs.subscribe(move |e| seen.lock().push(("b", *e)))
        };

        subs.emit(&1);
        a.unsubscribe();
        subs.emit(&2);
        drop(b);
        subs.emit(&3);

        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("b", 2)]);
        assert!(subs.is_empty());
    }
}
