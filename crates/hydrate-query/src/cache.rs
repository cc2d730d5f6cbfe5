//! Statement caching for expanded SQL.
//!
//! Dynamic batch loads expand their restriction to the exact number of keys;
//! the expanded text is cached per key count so repeated batch sizes avoid
//! redundant string building.

use std::collections::HashMap;
use std::sync::Arc;

/// A cached SQL statement.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    /// The rendered SQL string.
    pub sql: Arc<str>,
    /// Logical clock value of the last access.
    pub last_used: u64,
    /// Number of times this statement has been requested.
    pub hit_count: u64,
}

/// LRU-style cache for rendered SQL statements.
///
/// Keyed by a `u64` that callers compute from their query shape (for dynamic
/// batches, the key count). When the cache exceeds `max_size`, the
/// least-recently-used entry is evicted.
///
/// # Example
///
/// ```
/// use hydrate_query::cache::StatementCache;
///
/// let mut cache = StatementCache::new(100);
/// let sql = cache.get_or_insert(3, || "select p.id from people p where p.id in (?, ?, ?)".to_string());
/// assert!(sql.ends_with("(?, ?, ?)"));
/// assert!(cache.contains(3));
/// ```
#[derive(Debug)]
pub struct StatementCache {
    cache: HashMap<u64, CachedStatement>,
    max_size: usize,
    clock: u64,
}

impl StatementCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
            clock: 0,
        }
    }

    /// Get a cached statement or build and insert it.
    ///
    /// The `builder` closure is only called on cache miss.
    pub fn get_or_insert(&mut self, key: u64, builder: impl FnOnce() -> String) -> Arc<str> {
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }

        self.clock += 1;
        let now = self.clock;
        let entry = self.cache.entry(key).or_insert_with(|| CachedStatement {
            sql: Arc::from(builder()),
            last_used: now,
            hit_count: 0,
        });
        entry.last_used = now;
        entry.hit_count += 1;
        Arc::clone(&entry.sql)
    }

    /// Look up a statement, marking it recently used.
    pub fn get(&mut self, key: u64) -> Option<Arc<str>> {
        self.clock += 1;
        let now = self.clock;
        let entry = self.cache.get_mut(&key)?;
        entry.last_used = now;
        entry.hit_count += 1;
        Some(Arc::clone(&entry.sql))
    }

    /// Check if a statement is cached.
    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Clear all cached statements.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Evict the least-recently-used entry.
    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit() {
        let mut cache = StatementCache::new(10);
        let sql = cache.get_or_insert(1, || "select 1".to_string());
        assert_eq!(&*sql, "select 1");

        let called = std::cell::Cell::new(false);
        let sql2 = cache.get_or_insert(1, || {
            called.set(true);
            "select 1".to_string()
        });
        assert_eq!(&*sql2, "select 1");
        assert!(!called.get());
    }

    #[test]
    fn test_eviction() {
        let mut cache = StatementCache::new(2);
        cache.get_or_insert(1, || "select 1".to_string());
        cache.get_or_insert(2, || "select 2".to_string());
        cache.get_or_insert(3, || "select 3".to_string());

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_lru_ordering() {
        let mut cache = StatementCache::new(2);
        cache.get_or_insert(1, || "select 1".to_string());
        cache.get_or_insert(2, || "select 2".to_string());
        cache.get_or_insert(1, || unreachable!());
        cache.get_or_insert(3, || "select 3".to_string());

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_clear() {
        let mut cache = StatementCache::new(10);
        cache.get_or_insert(1, || "select 1".to_string());
        cache.clear();
        assert!(cache.is_empty());
    }
}
