use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded in-process TTL cache shared by the policy and row-filter layers.
///
/// Eviction on overflow drops expired entries first, then one arbitrary
/// entry. Readers never observe expired values.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
        if self.entries.len() >= self.capacity {
            let key = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(key) = key {
                self.entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted_value() {
        let cache = TtlCache::new(8);
        cache.insert("k", 42, Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(42));
    }

    #[test]
    fn expired_entries_are_invisible() {
        let cache = TtlCache::new(8);
        cache.insert("k", 1, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty(), "expired entry should be removed on read");
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = TtlCache::new(8);
        cache.insert("k", 1, Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn overflow_evicts_expired_first() {
        let cache = TtlCache::new(2);
        cache.insert("dead", 1, Duration::from_millis(1));
        cache.insert("live", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("new", 3, Duration::from_secs(60));
        assert_eq!(cache.get("live"), Some(2), "live entry must survive eviction");
        assert_eq!(cache.get("new"), Some(3));
        assert_eq!(cache.get("dead"), None);
    }

    #[test]
    fn overflow_with_no_expired_drops_one() {
        let cache = TtlCache::new(2);
        cache.insert("a", 1, Duration::from_secs(60));
        cache.insert("b", 2, Duration::from_secs(60));
        cache.insert("c", 3, Duration::from_secs(60));
        assert!(cache.len() <= 2, "capacity bound must hold, got {}", cache.len());
        assert_eq!(cache.get("c"), Some(3), "newest entry must be present");
    }
}
