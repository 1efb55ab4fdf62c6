//! Process-local expiring tier.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use super::lock::mutex_lock;
use super::pattern::glob_match;

const SOURCE: &str = "cache::local";
const METRIC_LOCAL_EVICT: &str = "strata_cache_local_evict_total";
const METRIC_SWEEP_REMOVED: &str = "strata_cache_sweep_removed_total";

/// Entry stored by [`LocalCache`]; never handed out by reference.
#[derive(Debug, Clone)]
pub struct LocalCacheItem<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> LocalCacheItem<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// True once strictly more than the TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Capacity-bounded, self-expiring key-value map shared across threads.
///
/// Entries are kept in recency order; at capacity an insert reclaims the
/// least recently used entry, which is counted as a sweep when it had already
/// expired and as an eviction otherwise. Reads return clones. Expired entries
/// are dropped on read and by [`sweep`](Self::sweep).
pub struct LocalCache<V> {
    name: &'static str,
    entries: Mutex<LruCache<String, LocalCacheItem<V>>>,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(name: &'static str, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = key.into();
        let item = LocalCacheItem::new(value, ttl);
        let now = Instant::now();

        let mut entries = mutex_lock(&self.entries, SOURCE, "set");
        let replacing = entries.contains(&key);
        let displaced = entries.push(key, item);
        drop(entries);

        if replacing {
            return;
        }
        if let Some((_, old)) = displaced {
            if old.is_expired_at(now) {
                counter!(METRIC_SWEEP_REMOVED, "tier" => self.name).increment(1);
            } else {
                counter!(METRIC_LOCAL_EVICT, "tier" => self.name).increment(1);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        match entries.get(key) {
            Some(item) if !item.is_expired_at(now) => return Some(item.value.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(key);
        None
    }

    pub fn delete(&self, key: &str) {
        mutex_lock(&self.entries, SOURCE, "delete").pop(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed = self.remove_where(|_, item| item.is_expired_at(now));
        if removed > 0 {
            counter!(METRIC_SWEEP_REMOVED, "tier" => self.name).increment(removed as u64);
        }
        removed
    }

    /// Remove entries whose key contains `pattern` or matches it as a glob.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        self.remove_where(|key, _| key.contains(pattern) || glob_match(pattern, key))
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, doomed: impl Fn(&str, &LocalCacheItem<V>) -> bool) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "remove_where");
        let keys: Vec<String> = entries
            .iter()
            .filter(|(key, item)| doomed(key, item))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn get_returns_value_until_expiry() {
        let cache = LocalCache::new("test", 16);
        cache.set("k", "v".to_string(), Duration::from_secs(10));

        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v"), "still live at exactly the TTL");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty(), "expired entry is removed on read");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let cache = LocalCache::new("test", 16);
        cache.set("short", 1_u32, Duration::from_secs(1));
        cache.set("long", 2_u32, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep(), 1);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some(2));
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = LocalCache::new("test", 16);
        cache.set("k", 1_u8, Duration::from_secs(5));
        cache.delete("k");
        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn zero_ttl_is_not_cached() {
        let cache = LocalCache::new("test", 16);
        cache.set("k", 1_u8, Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = LocalCache::new("test", 2);
        let ttl = Duration::from_secs(60);
        cache.set("a", 1_u8, ttl);
        cache.set("b", 2_u8, ttl);
        assert_eq!(cache.get("a"), Some(1));

        cache.set("c", 3_u8, ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lru_entry_makes_room() {
        let cache = LocalCache::new("test", 2);
        cache.set("stale", 1_u8, Duration::from_secs(1));
        cache.set("fresh", 2_u8, Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("new", 3_u8, Duration::from_secs(500));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("fresh"), Some(2));
        assert_eq!(cache.get("new"), Some(3));
    }

    #[test]
    fn concurrent_writers_never_exceed_capacity() {
        let cache = std::sync::Arc::new(LocalCache::new("test", 100));
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        cache.set(format!("k:{thread}:{i}"), i, Duration::from_secs(60));
                        assert!(cache.len() <= 100);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("writer thread should finish");
        }
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = LocalCache::new("test", 1);
        cache.set("k", 1_u8, Duration::from_secs(5));
        cache.set("k", 2_u8, Duration::from_secs(5));
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn remove_matching_handles_globs_and_substrings() {
        let cache = LocalCache::new("test", 16);
        let ttl = Duration::from_secs(60);
        cache.set("stats:user:1:todo", 1_u8, ttl);
        cache.set("stats:user:1:article", 2_u8, ttl);
        cache.set("stats:user:2:todo", 3_u8, ttl);
        cache.set("query:abc", 4_u8, ttl);

        assert_eq!(cache.remove_matching("stats:user:1:*"), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("stats:user:2:todo").is_some());

        cache.remove_matching("query:");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_do_not_need_external_locking() {
        let cache = std::sync::Arc::new(LocalCache::new("test", 10_000));
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let key = format!("k:{thread}:{i}");
                        cache.set(key.clone(), i, Duration::from_secs(60));
                        assert_eq!(cache.get(&key), Some(i));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("writer thread should finish");
        }
        assert_eq!(cache.len(), 2_000);
    }
}
