use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const DEFAULT_MAX_ENTRIES: usize = 64;
const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// LRU+TTL cache for a single list kind (tools, resources, resource
/// templates, or prompts), keyed by the serialised request params. `get`
/// and `set` never suspend, per the concurrency model.
pub struct ListCache<V: Clone> {
    entries: LruCache<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> ListCache<V> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }

    pub fn with_capacity(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_entries.max(1)).unwrap()),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let ttl = self.ttl;
        let hit = self.entries.get(key).filter(|e| e.inserted_at.elapsed() < ttl);
        let value = hit.map(|e| e.value.clone());
        if value.is_none() {
            self.entries.pop(key);
        }
        value
    }

    pub fn set(&mut self, key: String, value: V) {
        self.entries.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Invalidates every cached entry for this kind, on the matching
    /// `list_changed` notification.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }
}

impl<V: Clone> Default for ListCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_invalidates() {
        let mut cache: ListCache<Vec<String>> = ListCache::new();
        assert!(cache.get("").is_none());

        cache.set("".into(), vec!["a".into()]);
        assert_eq!(cache.get("").unwrap(), vec!["a".to_string()]);

        cache.invalidate_all();
        assert!(cache.get("").is_none());
    }

    #[test]
    fn expires_after_ttl() {
        let mut cache: ListCache<Vec<String>> =
            ListCache::with_capacity(8, Duration::from_millis(1));
        cache.set("".into(), vec!["a".into()]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("").is_none());
    }
}
