//! Keyed TTL cache.
//!
//! An entry is fresh while `now - stored_at < ttl`, evaluated with the policy passed at read time.
//! [`TtlCache::fetch`] returns a fresh entry without touching the loader; otherwise it runs the
//! loader and stores the result. A failed load removes whatever entry the key had, so a stale
//! value is never left reachable. Concurrent misses on one key both load and the last write wins,
//! but a load that overlaps any invalidation does not store its result.

use crate::clock::Clock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// A disabled policy never reads or writes the cache.
    pub enabled: bool,
}

impl CachePolicy {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl, enabled: true }
    }

    pub fn disabled() -> Self {
        Self { ttl: Duration::ZERO, enabled: false }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: u64,
}

struct Entries<V> {
    map: HashMap<String, CacheEntry<V>>,
    /// Bumped by every invalidation. A load only stores its result if this has not moved since
    /// the load began.
    generation: u64,
}

pub struct TtlCache<V> {
    entries: Mutex<Entries<V>>,
    clock: Arc<dyn Clock>,
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache").field("len", &self.len()).field("clock", &self.clock).finish()
    }
}

impl<V> TtlCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(Entries { map: HashMap::new(), generation: 0 }), clock }
    }

    fn entries(&self) -> MutexGuard<'_, Entries<V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let stored_at = self.clock.now_millis();
        self.entries().map.insert(key.into(), CacheEntry { value, stored_at });
    }

    /// Store `value` only if nothing was invalidated since `generation` was read.
    fn insert_if_current(&self, key: &str, value: V, generation: u64) -> bool {
        let stored_at = self.clock.now_millis();
        let mut entries = self.entries();
        if entries.generation != generation {
            return false;
        }
        entries.map.insert(key.to_owned(), CacheEntry { value, stored_at });
        true
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries();
        entries.generation += 1;
        let removed = entries.map.remove(key).is_some();
        if removed {
            tracing::trace!(key, "cache entry invalidated");
        }
        removed
    }

    /// Drop every key starting with `prefix`; returns how many went.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries();
        entries.generation += 1;
        let before = entries.map.len();
        entries.map.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.map.len();
        if removed > 0 {
            tracing::trace!(prefix, removed, "cache entries invalidated");
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries();
        entries.generation += 1;
        entries.map.clear();
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().map.is_empty()
    }
}

impl<V: Clone> TtlCache<V> {
    /// The cached value for `key` if it is younger than `ttl`.
    pub fn get_fresh(&self, key: &str, ttl: Duration) -> Option<V> {
        let now = self.clock.now_millis();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.entries()
            .map
            .get(key)
            .filter(|entry| now.saturating_sub(entry.stored_at) < ttl_ms)
            .map(|entry| entry.value.clone())
    }

    /// Fresh value for `key`, or the loader's result stored under `key`.
    ///
    /// A result whose load overlapped an invalidation is returned but not stored.
    pub async fn fetch<F, Fut, E>(&self, key: &str, policy: CachePolicy, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if policy.enabled {
            if let Some(hit) = self.get_fresh(key, policy.ttl) {
                tracing::trace!(key, "cache hit");
                return Ok(hit);
            }
            tracing::trace!(key, "cache miss");
        }

        let generation = self.entries().generation;
        match loader().await {
            Ok(value) => {
                if policy.enabled && !self.insert_if_current(key, value.clone(), generation) {
                    tracing::debug!(key, "invalidated while loading; result not cached");
                }
                Ok(value)
            }
            Err(err) => {
                self.invalidate(key);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (TtlCache<u32>, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (TtlCache::new(Arc::new(clock.clone())), clock)
    }

    async fn load(cache: &TtlCache<u32>, calls: &AtomicUsize, policy: CachePolicy) -> u32 {
        load_key(cache, "clients", calls, policy).await
    }

    async fn load_key(cache: &TtlCache<u32>, key: &str, calls: &AtomicUsize, policy: CachePolicy) -> u32 {
        cache
            .fetch(key, policy, || async {
                Ok::<_, ()>(calls.fetch_add(1, Ordering::SeqCst) as u32)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_entries_skip_the_loader() {
        let (cache, clock) = cache();
        let calls = AtomicUsize::new(0);
        let policy = CachePolicy::ttl(Duration::from_millis(1_000));

        assert_eq!(load(&cache, &calls, policy).await, 0);
        clock.advance(Duration::from_millis(999));
        assert_eq!(load(&cache, &calls, policy).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(101));
        assert_eq!(load(&cache, &calls, policy).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_load_removes_stale_entry() {
        let (cache, clock) = cache();
        cache.insert("pets", 7);
        clock.advance(Duration::from_secs(60));

        let err = cache
            .fetch("pets", CachePolicy::ttl(Duration::from_secs(1)), || async { Err::<u32, _>("offline") })
            .await
            .unwrap_err();
        assert_eq!(err, "offline");
        assert!(!cache.contains_key("pets"));
    }

    #[tokio::test]
    async fn disabled_policy_always_loads() {
        let (cache, _clock) = cache();
        let calls = AtomicUsize::new(0);
        load(&cache, &calls, CachePolicy::disabled()).await;
        load(&cache, &calls, CachePolicy::disabled()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn freshness_uses_ttl_at_read_time() {
        let (cache, clock) = cache();
        cache.insert("vets", 1);
        clock.advance(Duration::from_secs(200));
        assert_eq!(cache.get_fresh("vets", Duration::from_secs(600)), Some(1));
        assert_eq!(cache.get_fresh("vets", Duration::from_secs(120)), None);
    }

    #[tokio::test]
    async fn invalidation_during_load_keeps_result_out_of_cache() {
        let (cache, _clock) = cache();
        let policy = CachePolicy::ttl(Duration::from_secs(300));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let load = cache.fetch("list", policy, || async move {
            let _ = gate.await;
            Ok::<_, ()>(1)
        });
        let write = async {
            tokio::task::yield_now().await;
            cache.invalidate("list");
            let _ = release.send(());
        };
        let (loaded, ()) = tokio::join!(load, write);
        assert_eq!(loaded, Ok(1));
        assert!(!cache.contains_key("list"));

        let calls = AtomicUsize::new(0);
        assert_eq!(load_key(&cache, "list", &calls, policy).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_does_not_need_clone_values() {
        struct Handle;
        let cache: TtlCache<Handle> = TtlCache::new(Arc::new(ManualClock::new(0)));
        cache.insert("a", Handle);
        assert!(format!("{cache:?}").contains("len: 1"));
        assert!(cache.invalidate("a"));
    }

    #[test]
    fn prefix_invalidation() {
        let (cache, _clock) = cache();
        cache.insert("query:date=2024-01-01", 1);
        cache.insert("query:vet=3", 2);
        cache.insert("list", 3);
        assert_eq!(cache.invalidate_prefix("query:"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate("list"));
        assert!(!cache.invalidate("list"));
    }
}
