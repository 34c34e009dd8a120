//! A small, bounded, time-expiring cache.
//!
//! Entries live for a fixed time-to-live from insertion, and the cache never holds more
//! than a fixed number of entries. When full, expired entries are purged first and then
//! the least recently used entry is evicted. Callers must always tolerate a miss: an
//! entry may disappear before its expiry under capacity pressure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default time-to-live for cached entries.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of entries.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires: Instant,
    touched: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires <= now
    }
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, Entry<V>>,

    // Logical clock for recency, bumped on every read and write.
    tick: u64,
}

impl<V> Default for Inner<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
        }
    }
}

impl<V> Inner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// A shared cache mapping string keys to values with a fixed TTL and capacity.
///
/// Clones share the same underlying storage. All operations take a short internal
/// lock which is never held across an `.await`, so the cache is safe to use from many
/// concurrent requests without any external locking.
pub struct WeakCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<V> Clone for WeakCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
            capacity: self.capacity,
        }
    }
}

impl<V> fmt::Debug for WeakCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<V> Default for WeakCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION, DEFAULT_CAPACITY)
    }
}

impl<V> WeakCache<V> {
    /// Create a new cache where entries expire `ttl` after insertion and at most
    /// `capacity` entries are retained.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Default::default(),
            ttl,
            capacity,
        }
    }

    /// Number of entries currently stored, including any which have expired but have
    /// not yet been purged.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a value, resetting its expiry.
    pub fn put(&self, key: impl Into<String>, value: V) {
        if self.capacity == 0 {
            return;
        }

        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let touched = inner.next_tick();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let purged = inner.purge_expired(now);
            if purged > 0 {
                tracing::trace!(purged, "Purged expired cache entries");
            }

            if inner.entries.len() >= self.capacity {
                if let Some(evicted) = inner.evict_least_recent() {
                    tracing::trace!(key = %evicted, "Evicted least recently used cache entry");
                }
            }
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                expires: now + self.ttl,
                touched,
            },
        );
    }
}

impl<V> WeakCache<V>
where
    V: Clone,
{
    /// Look up a value. Expired entries are removed and reported as missing.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let touched = inner.next_tick();

        let entry = inner.entries.get_mut(key)?;
        if entry.is_expired(now) {
            inner.entries.remove(key);
            return None;
        }

        entry.touched = touched;
        Some(entry.value.clone())
    }
}
