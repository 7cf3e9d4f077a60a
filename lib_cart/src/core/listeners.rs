//! # Snapshot Listener Registry
//!
//! Fans every published [`CartSnapshot`] out to the registered listeners.
//!
//! ## Delivery rules:
//!
//! 1.  **Ordered**: snapshots are queued under the engine's state lock and
//!     drained after it is released, by a single drainer at a time. A listener
//!     never sees a version older than one it has already seen.
//! 2.  **Re-entrant**: listeners may call back into the engine. A snapshot
//!     published from inside a callback is queued and delivered by the drainer
//!     that is already running once the current callback returns.
//! 3.  **Isolated**: a panicking listener is logged and skipped; it does not
//!     stop delivery to the others.

use crate::model::CartSnapshot;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

pub(crate) type Listener = Arc<dyn Fn(&CartSnapshot) + Send + Sync>;

#[derive(Default)]
struct Outbox {
    queue: VecDeque<CartSnapshot>,
    draining: bool,
    delivered: Option<u64>,
}

/// # Listener Registry
///
/// Owns the listener list and the outbox of snapshots awaiting delivery.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: Mutex<Vec<(u64, Listener)>>,
    outbox: Mutex<Outbox>,
    next_id: AtomicU64,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        relock(&self.entries).push((id, listener));
        debug!(listener = id, "snapshot listener registered");
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut entries = relock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        let removed = entries.len() != before;
        if removed {
            debug!(listener = id, "snapshot listener removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        relock(&self.entries).len()
    }

    /// Queues a snapshot for delivery. Call while holding the state lock so
    /// that queue order matches version order.
    pub fn enqueue(&self, snapshot: CartSnapshot) {
        relock(&self.outbox).queue.push_back(snapshot);
    }

    /// Delivers queued snapshots. Must be called without the state lock held.
    pub fn flush(&self) {
        {
            let mut outbox = relock(&self.outbox);
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let next = {
                let mut outbox = relock(&self.outbox);
                match outbox.queue.pop_front() {
                    Some(snapshot) => {
                        if outbox.delivered.is_some_and(|seen| snapshot.version() <= seen) {
                            continue;
                        }
                        outbox.delivered = Some(snapshot.version());
                        snapshot
                    }
                    None => {
                        outbox.draining = false;
                        break;
                    }
                }
            };
            let listeners: Vec<Listener> = relock(&self.entries)
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in listeners {
                if panic::catch_unwind(AssertUnwindSafe(|| listener(&next))).is_err() {
                    warn!(version = next.version(), "snapshot listener panicked");
                }
            }
        }
    }
}

/// Handle returned by [`subscribe`](crate::CartEngine::subscribe). Dropping it
/// (or calling [`unsubscribe`](Subscription::unsubscribe)) removes the
/// listener.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: u64, registry: &Arc<ListenerRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64) -> CartSnapshot {
        let mut snap = CartSnapshot::empty();
        for _ in 0..version {
            snap.bump_version();
        }
        snap
    }

    #[test]
    fn delivers_in_version_order_and_skips_stale_entries() {
        let registry = Arc::new(ListenerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = Subscription::new(
            registry.add(Arc::new(move |s: &CartSnapshot| sink.lock().unwrap().push(s.version()))),
            &registry,
        );

        registry.enqueue(snapshot(1));
        registry.enqueue(snapshot(2));
        registry.flush();
        registry.enqueue(snapshot(2));
        registry.enqueue(snapshot(3));
        registry.flush();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn dropping_the_subscription_unsubscribes() {
        let registry = Arc::new(ListenerRegistry::new());
        let sub = Subscription::new(registry.add(Arc::new(|_: &CartSnapshot| {})), &registry);
        assert_eq!(registry.len(), 1);
        sub.unsubscribe();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn a_panicking_listener_does_not_block_the_others() {
        let registry = Arc::new(ListenerRegistry::new());
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let _bad = Subscription::new(registry.add(Arc::new(|_: &CartSnapshot| panic!("listener bug"))), &registry);
        let _good = Subscription::new(
            registry.add(Arc::new(move |_: &CartSnapshot| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            &registry,
        );

        registry.enqueue(snapshot(1));
        registry.flush();
        registry.enqueue(snapshot(2));
        registry.flush();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
