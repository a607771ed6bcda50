//! Cache configuration and the result type returned by cache lookups.

use std::fmt;

/// Configuration for a shared (Redis) cache tier
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis key prefix for this cache instance (e.g. "flag_engine:flag:")
    pub cache_prefix: String,

    /// TTL in seconds for cached values. `None` caches indefinitely.
    pub ttl_seconds: Option<u64>,
}

impl CacheConfig {
    pub fn new(cache_prefix: impl Into<String>, ttl_seconds: Option<u64>) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            ttl_seconds,
        }
    }

    pub fn with_ttl(cache_prefix: impl Into<String>, ttl_seconds: u64) -> Self {
        Self::new(cache_prefix, Some(ttl_seconds))
    }
}

/// Where a looked-up value came from.
///
/// `Display` gives the snake_case form used as a metric label:
/// ```
/// # use common_cache::CacheSource;
/// assert_eq!(CacheSource::SharedCache.to_string(), "shared_cache");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Answered by the in-process tier, including "known absent"
    LocalCache,
    /// Found in Redis
    SharedCache,
    /// Not in Redis, loaded from the source of truth
    LoaderCacheMiss,
    /// Redis held something unparseable, loaded from the source of truth
    LoaderCacheCorrupted,
    /// Redis failed, loaded from the source of truth without caching
    LoaderRedisUnavailable,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSource::LocalCache => write!(f, "local_cache"),
            CacheSource::SharedCache => write!(f, "shared_cache"),
            CacheSource::LoaderCacheMiss => write!(f, "loader_cache_miss"),
            CacheSource::LoaderCacheCorrupted => write!(f, "loader_cache_corrupted"),
            CacheSource::LoaderRedisUnavailable => write!(f, "loader_redis_unavailable"),
        }
    }
}

/// Result of a cache lookup. `value == None` means the item does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult<V> {
    pub value: Option<V>,
    pub source: CacheSource,
}

impl<V> CacheResult<V> {
    pub fn found(value: V, source: CacheSource) -> Self {
        Self {
            value: Some(value),
            source,
        }
    }

    pub fn not_found(source: CacheSource) -> Self {
        Self {
            value: None,
            source,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(
            self.source,
            CacheSource::LocalCache | CacheSource::SharedCache
        )
    }

    pub fn invoked_loader(&self) -> bool {
        matches!(
            self.source,
            CacheSource::LoaderCacheMiss
                | CacheSource::LoaderCacheCorrupted
                | CacheSource::LoaderRedisUnavailable
        )
    }

    pub fn had_cache_problem(&self) -> bool {
        matches!(
            self.source,
            CacheSource::LoaderCacheCorrupted | CacheSource::LoaderRedisUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_result_helpers() {
        let result: CacheResult<i32> = CacheResult::found(42, CacheSource::SharedCache);
        assert_eq!(result.value, Some(42));
        assert!(result.was_cached());
        assert!(!result.invoked_loader());
        assert!(!result.had_cache_problem());

        let result: CacheResult<i32> = CacheResult::not_found(CacheSource::LoaderCacheMiss);
        assert_eq!(result.value, None);
        assert!(!result.was_cached());
        assert!(result.invoked_loader());
        assert!(!result.had_cache_problem());

        let result: CacheResult<i32> = CacheResult::found(42, CacheSource::LoaderCacheCorrupted);
        assert!(result.had_cache_problem());
        assert!(result.invoked_loader());
    }

    #[test]
    fn test_local_absent_counts_as_cached() {
        let result: CacheResult<String> = CacheResult::not_found(CacheSource::LocalCache);
        assert!(result.was_cached());
        assert!(!result.invoked_loader());
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheSource::LocalCache.to_string(), "local_cache");
        assert_eq!(
            CacheSource::LoaderRedisUnavailable.to_string(),
            "loader_redis_unavailable"
        );
    }
}
