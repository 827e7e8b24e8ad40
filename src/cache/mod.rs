//! Generic in-memory cache with per-entry absolute expiry.
//!
//! A single exclusive writer lock guards `set`/`delete`/`clear`; readers take
//! a shared lock and never block each other (`spec.md` §5). Expired entries
//! are evicted lazily on `get` and, optionally, by a background sweeper.

pub mod expiry;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Thread-safe, generic TTL cache.
///
/// `Get` on an expired entry returns "absent" and lazily schedules the entry
/// for removal; it never blocks other readers while doing so.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache using the given clock for expiry comparisons.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Inserts or overwrites `key` with an absolute expiry instant.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn set(&self, key: K, value: V, expires_at: DateTime<Utc>) {
        let mut entries = self.write_lock();
        entries.insert(key, Entry { value, expires_at });
    }

    /// Inserts or overwrites `key` with an expiry `ttl` from now.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: StdDuration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let expires_at = self.clock.now() + ttl;
        self.set(key, value, expires_at);
    }

    /// Returns the cached value for `key`, or `None` if absent or expired.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.read_lock();
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > self.clock.now() {
                    trace!("cache hit");
                    return Some(entry.value.clone());
                }
            } else {
                trace!("cache miss");
                return None;
            }
        }

        // Entry existed but was expired: evict it under the writer lock.
        // Another thread may already have removed or replaced it, which is
        // harmless — we only ever delete a still-expired entry.
        let mut entries = self.write_lock();
        if let Some(entry) = entries.get(key)
            && entry.expires_at <= self.clock.now()
        {
            entries.remove(key);
            debug!("evicted expired cache entry");
        }
        None
    }

    /// Removes `key` unconditionally.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn delete(&self, key: &K) {
        self.write_lock().remove(key);
    }

    /// Removes every entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn clear(&self) {
        self.write_lock().clear();
    }

    /// Removes every entry whose expiry has passed. Intended to be driven by
    /// a background sweeper at a fixed cadence (`spec.md` §4.3, §5).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.write_lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of entries currently stored, expired or not.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Whether the cache currently holds no entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, Entry<V>>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<K, Entry<V>>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Spawns a background task that calls [`TtlCache::sweep_expired`] at a fixed
/// cadence until the returned handle is aborted.
///
/// `spec.md` §4.3/§5 call this "optional but recommended" at a 1-minute
/// cadence; the cadence is a parameter here so tests can use a much shorter
/// interval.
pub fn spawn_sweeper<K, V>(
    cache: Arc<TtlCache<K, V>>,
    interval: StdDuration,
) -> tokio::task::JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                debug!(removed, "cache sweeper evicted expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn get_returns_value_when_expiry_is_in_the_future() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache: TtlCache<String, i32> = TtlCache::new(clock.clone());

        cache.set("k".to_owned(), 1, epoch() + chrono::Duration::seconds(10));
        assert_eq!(cache.get(&"k".to_owned()), Some(1));
    }

    #[test]
    fn get_returns_absent_once_expiry_has_passed() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache: TtlCache<String, i32> = TtlCache::new(clock.clone());

        cache.set("k".to_owned(), 1, epoch() + chrono::Duration::seconds(10));
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(cache.get(&"k".to_owned()), None);
    }

    #[test]
    fn expired_entry_is_evicted_lazily_on_get() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache: TtlCache<String, i32> = TtlCache::new(clock.clone());

        cache.set("k".to_owned(), 1, epoch() + chrono::Duration::seconds(1));
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(cache.get(&"k".to_owned()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_removes_an_entry_regardless_of_expiry() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache: TtlCache<String, i32> = TtlCache::new(clock);

        cache.set("k".to_owned(), 1, epoch() + chrono::Duration::seconds(10));
        cache.delete(&"k".to_owned());
        assert_eq!(cache.get(&"k".to_owned()), None);
    }

    #[test]
    fn clear_empties_the_cache() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache: TtlCache<String, i32> = TtlCache::new(clock);

        cache.set("a".to_owned(), 1, epoch() + chrono::Duration::seconds(10));
        cache.set("b".to_owned(), 2, epoch() + chrono::Duration::seconds(10));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_expired_removes_only_stale_entries() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache: TtlCache<String, i32> = TtlCache::new(clock.clone());

        cache.set("stale".to_owned(), 1, epoch() + chrono::Duration::seconds(1));
        cache.set("fresh".to_owned(), 2, epoch() + chrono::Duration::seconds(120));
        clock.advance(chrono::Duration::seconds(2));

        let removed = cache.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(cache.get(&"fresh".to_owned()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_evicts_on_its_own_cadence() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let cache = Arc::new(TtlCache::<String, i32>::new(clock.clone()));
        cache.set("k".to_owned(), 1, epoch() + chrono::Duration::seconds(1));

        let handle = spawn_sweeper(cache.clone(), StdDuration::from_millis(10));
        clock.advance(chrono::Duration::seconds(2));
        tokio::time::advance(StdDuration::from_millis(25)).await;
        tokio::task::yield_now().await;

        assert!(cache.is_empty());
        handle.abort();
    }
}
