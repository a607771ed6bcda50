//! In-process cache tier.
//!
//! Each service instance keeps its own [`LocalCache`]. Entries expire after a
//! short TTL so a missed invalidation can only serve stale data for that long.
//! Absence is cached too, which keeps hot lookups for unknown keys off Redis.
//!
//! Separately, the most recent value ever seen for a key is retained without a
//! TTL (bounded only by capacity) so callers can degrade to it when every other
//! tier is unavailable.

use moka::sync::Cache;
use std::time::Duration;

#[derive(Clone)]
pub struct LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fresh: Cache<String, Option<V>>,
    last_known: Cache<String, V>,
}

impl<V> LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// # Arguments
    /// * `max_capacity` - Maximum entries per tier
    /// * `ttl` - How long a fresh entry answers lookups
    ///
    /// # Example
    /// ```rust
    /// use common_cache::LocalCache;
    /// use std::time::Duration;
    ///
    /// let cache: LocalCache<String> = LocalCache::new(1000, Duration::from_secs(5));
    /// cache.insert("key", Some("value".to_string()));
    /// assert_eq!(cache.get("key"), Some(Some("value".to_string())));
    /// ```
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let fresh = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        let last_known = Cache::builder().max_capacity(max_capacity).build();

        Self { fresh, last_known }
    }

    /// `None` is a miss; `Some(None)` means the key is known not to exist.
    pub fn get(&self, key: &str) -> Option<Option<V>> {
        self.fresh.get(key)
    }

    pub fn insert(&self, key: &str, value: Option<V>) {
        if let Some(v) = &value {
            self.last_known.insert(key.to_string(), v.clone());
        }
        self.fresh.insert(key.to_string(), value);
    }

    /// Drops the fresh entry only. The last-known value survives invalidation.
    pub fn invalidate(&self, key: &str) {
        self.fresh.invalidate(key);
    }

    pub fn last_known(&self, key: &str) -> Option<V> {
        self.last_known.get(key)
    }

    /// Drops every fresh entry. Last-known values are kept.
    pub fn clear(&self) {
        self.fresh.invalidate_all();
    }
}
