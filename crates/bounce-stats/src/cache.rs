use lru_cache::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Item<V> {
    item: V,
    expiration: Instant,
}

/// A bounded LRU cache whose entries expire after a fixed TTL.
/// Used to serve hot-path admission reads of computed stat windows
/// without hitting the durable store on every check. Writes to the
/// store invalidate the affected entry so that the stale-read window
/// never exceeds the TTL.
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    cache: Mutex<LruCache<K, Item<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(key)?;
        if Instant::now() < entry.expiration {
            Some(entry.item.clone())
        } else {
            cache.remove(key);
            None
        }
    }

    pub fn insert(&self, key: K, item: V) -> V {
        self.cache.lock().insert(
            key,
            Item {
                item: item.clone(),
                expiration: Instant::now() + self.ttl,
            },
        );
        item
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.lock().remove(key);
    }

    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock();
        let num_entries = cache.len();
        cache.clear();
        num_entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expiry_and_invalidation() {
        let cache: TtlCache<&str, u32> = TtlCache::new(4, Duration::from_millis(20));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);

        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn lru_eviction() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.get(&3), Some(3));
    }
}
