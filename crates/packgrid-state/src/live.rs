//! LiveQueue: an in-memory, never persisted collection.
//!
//! Used for transient request queues that observers still want to watch.
//! Shares the subscription model of [`Collection`](crate::Collection).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use packgrid_core::epoch_millis;

use crate::subscribe::{Subscribers, Subscription};

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry<T> {
    pub id: String,
    pub added_at: u64,
    pub item: T,
}

#[derive(Debug, Clone)]
pub enum QueueEvent<T> {
    Changed(QueueEntry<T>),
    Removed(String),
}

struct LiveInner<T> {
    name: String,
    prefix: String,
    next_id: AtomicU64,
    entries: RwLock<Vec<QueueEntry<T>>>,
    subscribers: Subscribers<QueueEvent<T>>,
}

pub struct LiveQueue<T> {
    inner: Arc<LiveInner<T>>,
}

impl<T> Clone for LiveQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LiveQueue<T> {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                name: name.to_string(),
                prefix: format!("{}", epoch_millis()),
                next_id: AtomicU64::new(1),
                entries: RwLock::new(Vec::new()),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Ids are unique for the lifetime of the process.
    pub fn next_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}_{n}", self.inner.prefix)
    }

    /// Append an item and return its id.
    pub fn push(&self, item: T) -> String {
        let entry = QueueEntry {
            id: self.next_id(),
            added_at: epoch_millis(),
            item,
        };
        let id = entry.id.clone();
        self.inner.entries.write().push(entry.clone());
        self.inner.subscribers.emit(&QueueEvent::Changed(entry));
        id
    }

    /// Mutate an entry in place; returns false when the id is unknown.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        let updated = {
            let mut entries = self.inner.entries.write();
            match entries.iter_mut().find(|e| e.id == id) {
                Some(entry) => {
                    f(&mut entry.item);
                    Some(entry.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(entry) => {
                self.inner.subscribers.emit(&QueueEvent::Changed(entry));
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        let removed = {
            let mut entries = self.inner.entries.write();
            let pos = entries.iter().position(|e| e.id == id)?;
            entries.remove(pos)
        };
        self.inner
            .subscribers
            .emit(&QueueEvent::Removed(removed.id.clone()));
        Some(removed.item)
    }

    pub fn get(&self, id: &str) -> Option<QueueEntry<T>> {
        self.inner.entries.read().iter().find(|e| e.id == id).cloned()
    }

    /// Snapshot in insertion order.
    pub fn entries(&self) -> Vec<QueueEntry<T>> {
        self.inner.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&QueueEvent<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribers.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_update_remove() {
        let q: LiveQueue<u32> = LiveQueue::new("deploys");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            q.subscribe(move |ev| {
                let tag = match ev {
                    QueueEvent::Changed(e) => format!("changed:{}", e.item),
                    QueueEvent::Removed(_) => "removed".to_string(),
                };
                seen.lock().push(tag);
            })
        };

        let a = q.push(1);
        let b = q.push(2);
        assert_ne!(a, b);
        assert!(q.update(&a, |v| *v = 10));
        assert!(!q.update("nope", |v| *v = 0));
        assert_eq!(q.remove(&b), Some(2));
        assert_eq!(q.remove(&b), None);

        let items: Vec<u32> = q.entries().into_iter().map(|e| e.item).collect();
        assert_eq!(items, vec![10]);
        assert_eq!(
            *seen.lock(),
            vec!["changed:1", "changed:2", "changed:10", "removed"]
        );
    }
}
