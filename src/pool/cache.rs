//! Bounded, time-to-live cache of idle resources
//!
//! Entries are held in insertion order. Two paths remove them:
//! - capacity overflow on [`TtlCache::put`] evicts the oldest entry at once
//! - a reaper task (one per cache, shared by all entries) wakes at the
//!   earliest expiry and evicts every entry older than the TTL
//!
//! Membership in the store is the single source of truth: whichever path
//! removes an entry under the store lock is the one that hands it to the
//! release callback, so each entry is released at most once. The callback
//! always runs after the lock is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Callback invoked with every evicted item
pub type ReleaseFn<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Entry<T> {
    item: T,
    inserted_at: Instant,
}

struct Store<T> {
    entries: VecDeque<Entry<T>>,
    reaper: Option<JoinHandle<()>>,
}

struct Inner<T> {
    store: Mutex<Store<T>>,
    capacity: usize,
    ttl: Duration,
    on_release: ReleaseFn<T>,
    wakeup: Notify,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Store<T>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_all(&self, items: Vec<T>) {
        for item in items {
            (self.on_release)(item);
        }
    }

    /// Remove every entry inserted more than `ttl` before `now`
    fn take_expired(&self, store: &mut Store<T>, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(front) = store.entries.front() {
            if now.saturating_duration_since(front.inserted_at) < self.ttl {
                break;
            }
            if let Some(entry) = store.entries.pop_front() {
                expired.push(entry.item);
            }
        }
        expired
    }
}

/// Size-bounded store of idle resources with per-entry expiry
pub struct TtlCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> TtlCache<T> {
    /// Create a cache holding at most `capacity` entries for at most `ttl`
    /// each. `on_release` receives every entry the cache evicts.
    pub fn new<F>(capacity: usize, ttl: Duration, on_release: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store {
                    entries: VecDeque::with_capacity(capacity),
                    reaper: None,
                }),
                capacity,
                ttl,
                on_release: Arc::new(on_release),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Insert an idle item, evicting the oldest entry if the cache is full
    pub fn put(&self, item: T) {
        let mut evicted = Vec::new();
        {
            let mut store = self.inner.lock();

            if self.inner.capacity == 0 {
                evicted.push(item);
            } else {
                while store.entries.len() >= self.inner.capacity {
                    match store.entries.pop_front() {
                        Some(entry) => evicted.push(entry.item),
                        None => break,
                    }
                }
                let was_empty = store.entries.is_empty();
                store.entries.push_back(Entry {
                    item,
                    inserted_at: Instant::now(),
                });
                self.ensure_reaper(&mut store);
                if was_empty {
                    self.inner.wakeup.notify_one();
                }
            }
        }

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Cache full, evicting oldest entry");
        }
        self.inner.release_all(evicted);
    }

    /// Remove and return the most recently inserted entry that has not
    /// expired. Expired entries found on the way are released.
    pub fn get(&self) -> Option<T> {
        let (item, expired) = {
            let mut store = self.inner.lock();
            let expired = self.inner.take_expired(&mut store, Instant::now());
            (store.entries.pop_back().map(|entry| entry.item), expired)
        };

        if !expired.is_empty() {
            trace!(expired = expired.len(), "Dropping expired entries on get");
        }
        self.inner.release_all(expired);
        item
    }

    /// Release every held entry and empty the cache
    pub fn evict_all(&self) {
        let drained: Vec<T> = {
            let mut store = self.inner.lock();
            store.entries.drain(..).map(|entry| entry.item).collect()
        };

        if !drained.is_empty() {
            debug!(evicted = drained.len(), "Evicting all cached entries");
        }
        self.inner.release_all(drained);
    }

    /// Current number of resident entries
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// A gauge closure reporting the current size, usable after the cache
    /// itself has been moved elsewhere
    pub fn size_gauge(&self) -> impl Fn() -> usize + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || match inner.upgrade() {
            Some(inner) => {
                let size = inner.lock().entries.len();
                size
            }
            None => 0,
        }
    }

    /// Start the reaper on first use. Without a tokio runtime, expiry is
    /// still enforced on `get`.
    fn ensure_reaper(&self, store: &mut Store<T>) {
        if store.reaper.is_some() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&self.inner);
            store.reaper = Some(handle.spawn(reap(weak)));
        }
    }
}

/// Expire entries as their TTL elapses. Exits once the cache is dropped.
async fn reap<T: Send + 'static>(weak: Weak<Inner<T>>) {
    loop {
        let next_deadline = {
            let Some(inner) = weak.upgrade() else { return };
            let store = inner.lock();
            store.entries.front().map(|entry| entry.inserted_at + inner.ttl)
        };

        match next_deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => {
                // Holding a strong ref here is fine: dropping the cache aborts us
                let Some(inner) = weak.upgrade() else { return };
                inner.wakeup.notified().await;
                continue;
            }
        }

        let Some(inner) = weak.upgrade() else { return };
        let expired = {
            let mut store = inner.lock();
            inner.take_expired(&mut store, Instant::now())
        };
        if !expired.is_empty() {
            debug!(expired = expired.len(), ttl = ?inner.ttl, "Expiring idle entries");
        }
        inner.release_all(expired);
    }
}

/// Dropping the cache releases whatever it still holds
impl<T> Drop for TtlCache<T> {
    fn drop(&mut self) {
        let drained: Vec<T> = {
            let mut store = self.inner.lock();
            if let Some(reaper) = store.reaper.take() {
                reaper.abort();
            }
            store.entries.drain(..).map(|entry| entry.item).collect()
        };

        if !drained.is_empty() {
            trace!(released = drained.len(), "Releasing entries of dropped cache");
        }
        self.inner.release_all(drained);
    }
}

impl<T> fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("size", &self.inner.lock().entries.len())
            .field("capacity", &self.inner.capacity)
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}
