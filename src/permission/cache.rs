use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::types::TransitionEvent;
use crate::store::FlagStore;

pub trait TransitionHandler: Send + Sync {
    fn handle(&self, event: TransitionEvent);
}

impl<F> TransitionHandler for F
where
    F: Fn(TransitionEvent) + Send + Sync,
{
    fn handle(&self, event: TransitionEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default)]
struct Entry {
    value: Option<bool>,
    /// Sequence number of the read that produced `value`.
    generation: u64,
}

/// Memoized view of the permission flag.
///
/// The store is only consulted on a miss or an explicit refresh. After every
/// refresh the previous and new values are compared and subscribers hear
/// about genuine `false <-> true` changes only. When refreshes overlap, a
/// read that started before one already applied is dropped.
pub struct PermissionCache {
    store: Arc<dyn FlagStore>,
    entry: Mutex<Entry>,
    handlers: Mutex<Vec<(SubscriptionId, Arc<dyn TransitionHandler>)>>,
    next_id: AtomicU64,
    next_read: AtomicU64,
}

impl PermissionCache {
    #[must_use]
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self {
            store,
            entry: Mutex::new(Entry::default()),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_read: AtomicU64::new(1),
        }
    }

    pub async fn get(&self) -> bool {
        let cached = self.entry.lock().value;
        match cached {
            Some(value) => value,
            None => self.refresh_and_get().await,
        }
    }

    pub async fn refresh(&self) {
        self.refresh_and_get().await;
    }

    pub async fn refresh_and_get(&self) -> bool {
        let generation = self.next_read.fetch_add(1, Ordering::SeqCst);
        let current = self.store.read().await;

        let previous = {
            let mut entry = self.entry.lock();
            if generation < entry.generation {
                debug!(
                    generation,
                    applied = entry.generation,
                    "Dropping stale permission read"
                );
                return entry.value.unwrap_or(current);
            }
            entry.generation = generation;
            entry.value.replace(current)
        };

        match TransitionEvent::between(previous, current) {
            Some(event) => {
                info!(
                    from = event.from,
                    to = event.to,
                    "Permission flag {}",
                    event.kind()
                );
                self.emit(event);
            }
            None if previous.is_none() => {
                debug!(value = current, "Permission cache populated");
            }
            None => {}
        }

        current
    }

    /// The cached entry, without touching the store.
    #[must_use]
    pub fn peek(&self) -> Option<bool> {
        self.entry.lock().value
    }

    /// Forgets the cached value. The next read repopulates it silently.
    pub fn invalidate(&self) {
        self.entry.lock().value = None;
    }

    pub fn subscribe(&self, handler: Arc<dyn TransitionHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn emit(&self, event: TransitionEvent) {
        // Deliver from a snapshot so handlers may (un)subscribe re-entrantly.
        let handlers: Vec<Arc<dyn TransitionHandler>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler.handle(event);
        }
    }
}
