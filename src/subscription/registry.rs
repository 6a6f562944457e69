//! Ordered registry of response observers.
//!
//! Entries are kept in registration order and carry a sequential ID, so a
//! [`Subscription`] handle can revoke exactly its own registration. The same
//! observer instance (same `Arc`) is never registered twice; subscribing it
//! again hands out another handle to the same entry.
//!
//! A registration lives as long as at least one of its handles. Dropping the
//! last handle removes it, and [`Subscription::unsubscribe`] removes it at once.
//!
//! Notifications iterate a snapshot taken under the lock; observers may
//! subscribe or unsubscribe from inside a callback.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pipelink::subscription::{Observer, SubscriptionRegistry};
//!
//! struct Printer;
//! impl Observer<String> for Printer {
//!     fn on_next(&self, value: &String) {
//!         println!("{}", value);
//!     }
//! }
//!
//! let registry = SubscriptionRegistry::<String>::new();
//! let subscription = registry.subscribe(Arc::new(Printer));
//! registry.notify_next(&"hello".to_string());
//! drop(subscription);
//! assert!(registry.is_empty());
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::Observer;
use crate::error::PipeLinkError;

/// Registered observer.
struct Entry<T> {
    /// Assigned subscription ID.
    id: u64,
    /// The observer itself.
    observer: Arc<dyn Observer<T>>,
    /// Live `Subscription` handles pointing at this entry.
    handles: usize,
}

/// Lock-protected registry state.
struct Entries<T> {
    /// Live registrations in registration order.
    list: Vec<Entry<T>>,
    /// Next subscription ID to assign.
    next_id: u64,
}

/// Type-erased removal, so handles don't carry the response type.
trait Revoke: Send + Sync {
    fn revoke(&self, id: u64) -> bool;
    fn release(&self, id: u64);
    fn contains(&self, id: u64) -> bool;
}

struct Shared<T> {
    entries: Mutex<Entries<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Removed entries are dropped after the lock is released: an observer may
// own a `Subscription`, whose drop takes the lock again.
impl<T: 'static> Revoke for Shared<T> {
    fn revoke(&self, id: u64) -> bool {
        let removed = {
            let mut entries = self.lock();
            let index = entries.list.iter().position(|e| e.id == id);
            index.map(|index| entries.list.remove(index))
        };
        removed.is_some()
    }

    fn release(&self, id: u64) {
        let _removed = {
            let mut entries = self.lock();
            let Some(index) = entries.list.iter().position(|e| e.id == id) else {
                return;
            };
            entries.list[index].handles -= 1;
            if entries.list[index].handles > 0 {
                return;
            }
            entries.list.remove(index)
        };
    }

    fn contains(&self, id: u64) -> bool {
        self.lock().list.iter().any(|e| e.id == id)
    }
}

/// Identity of an observer allocation, ignoring the vtable.
fn observer_key<T>(observer: &Arc<dyn Observer<T>>) -> *const () {
    Arc::as_ptr(observer) as *const ()
}

/// Registry of response observers.
pub struct SubscriptionRegistry<T> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> SubscriptionRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Entries {
                    list: Vec::new(),
                    next_id: 1,
                }),
            }),
        }
    }

    /// Register an observer.
    ///
    /// If this exact observer instance is already registered, the returned
    /// handle refers to the existing registration, which then stays live
    /// until every handle to it is dropped.
    pub fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Subscription {
        let key = observer_key(&observer);
        let id = {
            let mut entries = self.shared.lock();
            match entries.list.iter_mut().find(|e| observer_key(&e.observer) == key) {
                Some(existing) => {
                    existing.handles += 1;
                    existing.id
                }
                None => {
                    let id = entries.next_id;
                    entries.next_id += 1;
                    entries.list.push(Entry {
                        id,
                        observer,
                        handles: 1,
                    });
                    id
                }
            }
        };

        let revoke: Arc<dyn Revoke> = self.shared.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&revoke),
        }
    }

    /// Remove the registration with `id`. Returns false if it was not present.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.revoke(id)
    }

    /// Remove every registration.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut self.shared.lock().list);
        drop(removed);
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.shared.lock().list.len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn Observer<T>>> {
        self.shared
            .lock()
            .list
            .iter()
            .map(|e| e.observer.clone())
            .collect()
    }

    /// Deliver a response to every observer, in registration order.
    pub fn notify_next(&self, value: &T) {
        for observer in self.snapshot() {
            observer.on_next(value);
        }
    }

    /// Deliver a decode failure to every observer.
    pub fn notify_error(&self, error: &PipeLinkError) {
        for observer in self.snapshot() {
            observer.on_error(error);
        }
    }

    /// Deliver end-of-batch to every observer.
    pub fn notify_completed(&self) {
        for observer in self.snapshot() {
            observer.on_completed();
        }
    }
}

impl<T: 'static> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one registration.
///
/// Dropping the handle releases it. The observer is unregistered once no
/// handle to its registration is left.
#[must_use = "dropping a Subscription unregisters the observer"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Revoke>,
}

impl Subscription {
    /// Subscription ID, shared by handles to the same registration.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove this registration now, even if other handles still refer to
    /// it. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.revoke(self.id),
            None => false,
        }
    }

    /// Whether the registration is still live.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.contains(self.id))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
