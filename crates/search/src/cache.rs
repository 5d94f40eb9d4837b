//! LRU + TTL cache primitive shared by the query-embedding and
//! query-result caches.
//!
//! Keys are normalized strings; the result cache additionally folds the
//! canonical filter serialization into its key so equivalent filters share
//! an entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted: Instant,
    last_used: u64,
}

pub struct LruTtlCache<V> {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState<V>>,
}

struct CacheState<V> {
    entries: HashMap<String, Entry<V>>,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl<V: Clone> LruTtlCache<V> {
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock().ok()?;
        state.clock += 1;
        let clock = state.clock;
        let ttl = self.ttl;

        let expired = match state.entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() <= ttl => {
                entry.last_used = clock;
                let value = entry.value.clone();
                state.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        state.misses += 1;
        None
    }

    pub fn put(&self, key: String, value: V) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.clock += 1;
        let clock = state.clock;
        state.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                last_used: clock,
            },
        );
        if state.entries.len() > self.capacity {
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&oldest);
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since construction.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        self.state
            .lock()
            .map(|s| (s.hits, s.misses))
            .unwrap_or((0, 0))
    }
}

/// Normalize a query for cache keys: trim, lowercase, collapse whitespace.
#[must_use]
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_round_trip() {
        let cache: LruTtlCache<u32> = LruTtlCache::new(10, Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.put("k".to_string(), 7);
        assert_eq!(cache.get("k"), Some(7));
        assert_eq!(cache.counters(), (1, 1));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache: LruTtlCache<u32> = LruTtlCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        // Touch "a" so "b" is the LRU victim.
        assert_eq!(cache.get("a"), Some(1));
        cache.put("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(1));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache: LruTtlCache<u32> = LruTtlCache::new(4, Duration::from_millis(20));
        cache.put("short".to_string(), 1);
        assert_eq!(cache.get("short"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("short").is_none());
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        assert_eq!(normalize_query("  React   HOOKS  "), "react hooks");
        assert_eq!(normalize_query("react hooks"), normalize_query("React  Hooks"));
        assert_eq!(normalize_query(""), "");
    }
}
