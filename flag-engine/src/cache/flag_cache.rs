use std::sync::Arc;
use std::time::Duration;

use common_cache::{CacheConfig, CacheSource, LocalCache, ReadThroughCache};
use common_redis::Client as RedisClient;
use tracing::{debug, warn};

use crate::{
    flags::flag_models::FlagSnapshot,
    metrics::{
        consts::{
            FLAG_CACHE_HIT_COUNTER, FLAG_CACHE_INVALIDATION_ERRORS_COUNTER,
            FLAG_CACHE_MISS_COUNTER, STORE_READS_COUNTER, STORE_READ_ERRORS_COUNTER,
            STORE_READ_TIME,
        },
        utils::{inc, label, timing_guard},
    },
    store::{FlagStore, StoreError},
};

pub const FLAG_CACHE_PREFIX: &str = "flag_engine:flag:";
pub const FLAG_KEYS_CACHE_PREFIX: &str = "flag_engine:flag_keys:";
const ALL_FLAG_KEYS: &str = "all";

#[derive(Debug, Clone)]
pub struct FlagCacheSettings {
    pub local_ttl: Duration,
    pub local_max_entries: u64,
    pub shared_ttl_seconds: u64,
    pub store_timeout: Duration,
    /// How long after a mutation any shared-tier load that read the store
    /// before it is guaranteed to have finished writing back.
    pub shared_settle_delay: Duration,
}

/// Local tier, then shared tier, then the store.
///
/// The local tier is per instance and caches absence as well as hits. The
/// shared tier is optional; without Redis every local miss reads the store.
/// Store reads are bounded by `store_timeout`.
pub struct FlagCache {
    store: Arc<dyn FlagStore>,
    local: LocalCache<FlagSnapshot>,
    local_keys: LocalCache<Vec<String>>,
    shared: Option<ReadThroughCache>,
    shared_keys: Option<ReadThroughCache>,
    store_timeout: Duration,
    settle_delay: Duration,
}

impl FlagCache {
    pub fn new(
        store: Arc<dyn FlagStore>,
        redis: Option<Arc<dyn RedisClient + Send + Sync>>,
        settings: &FlagCacheSettings,
    ) -> Self {
        let (shared, shared_keys) = match redis {
            Some(redis) => (
                Some(ReadThroughCache::new(
                    redis.clone(),
                    CacheConfig::with_ttl(FLAG_CACHE_PREFIX, settings.shared_ttl_seconds),
                )),
                Some(ReadThroughCache::new(
                    redis,
                    CacheConfig::with_ttl(FLAG_KEYS_CACHE_PREFIX, settings.shared_ttl_seconds),
                )),
            ),
            None => (None, None),
        };

        Self {
            store,
            local: LocalCache::new(settings.local_max_entries, settings.local_ttl),
            local_keys: LocalCache::new(1, settings.local_ttl),
            shared,
            shared_keys,
            store_timeout: settings.store_timeout,
            settle_delay: settings.shared_settle_delay,
        }
    }

    /// `Ok(None)` means the flag does not exist. Errors mean no tier could
    /// answer; callers degrade with [`last_known`](Self::last_known).
    pub async fn get_snapshot(&self, flag_key: &str) -> Result<Option<FlagSnapshot>, StoreError> {
        if let Some(cached) = self.local.get(flag_key) {
            debug!(flag_key = %flag_key, "local cache hit");
            inc(FLAG_CACHE_HIT_COUNTER, &[label("tier", "local")], 1);
            return Ok(cached);
        }

        let key = flag_key.to_string();
        let snapshot = match &self.shared {
            Some(shared) => {
                let store = self.store.clone();
                let timeout = self.store_timeout;
                let result = shared
                    .get_or_load(&key, move |k: &String| {
                        load_snapshot(store, k.clone(), timeout)
                    })
                    .await
                    .inspect_err(|e| record_store_error(flag_key, e))?;
                record_cache_source(result.source);
                result.value
            }
            None => {
                inc(FLAG_CACHE_MISS_COUNTER, &[label("source", "no_shared_tier")], 1);
                load_snapshot(self.store.clone(), key, self.store_timeout)
                    .await
                    .inspect_err(|e| record_store_error(flag_key, e))?
            }
        };

        self.local.insert(flag_key, snapshot.clone());
        Ok(snapshot)
    }

    /// Keys of every non-archived flag, through the same tiers.
    pub async fn flag_keys(&self) -> Result<Vec<String>, StoreError> {
        if let Some(Some(keys)) = self.local_keys.get(ALL_FLAG_KEYS) {
            return Ok(keys);
        }

        let keys = match &self.shared_keys {
            Some(shared) => {
                let store = self.store.clone();
                let timeout = self.store_timeout;
                let result = shared
                    .get_or_load(&ALL_FLAG_KEYS.to_string(), move |_: &String| {
                        load_flag_keys(store, timeout)
                    })
                    .await?;
                result.value.unwrap_or_default()
            }
            None => load_flag_keys(self.store.clone(), self.store_timeout)
                .await?
                .unwrap_or_default(),
        };

        self.local_keys.insert(ALL_FLAG_KEYS, Some(keys.clone()));
        Ok(keys)
    }

    /// Most recent snapshot this instance has seen, regardless of age.
    pub fn last_known(&self, flag_key: &str) -> Option<FlagSnapshot> {
        self.local.last_known(flag_key)
    }

    pub fn last_known_flag_keys(&self) -> Option<Vec<String>> {
        self.local_keys.last_known(ALL_FLAG_KEYS)
    }

    /// Mutation path, run after the store write: rewrite the shared entry
    /// from the store and drop this instance's local entry.
    pub async fn refresh(&self, flag_key: &str) {
        self.refresh_shared(flag_key).await;
        self.invalidate_local(flag_key);
    }

    /// Second pass of the mutation path, run in the background. A load that
    /// read the store before the write can land its copy in the shared tier
    /// after [`refresh`](Self::refresh); once the settle delay has passed
    /// every such load is done, and the entry is rewritten again.
    pub async fn settle(&self, flag_key: &str) {
        if self.shared.is_none() {
            return;
        }
        tokio::time::sleep(self.settle_delay).await;
        self.refresh_shared(flag_key).await;
    }

    /// Drop the flag from this instance only, on receipt of a broadcast.
    pub fn invalidate_local(&self, flag_key: &str) {
        self.local.invalidate(flag_key);
        self.local_keys.invalidate(ALL_FLAG_KEYS);
    }

    /// Drop every local entry, after invalidations may have been missed.
    /// Last-known values are kept.
    pub fn clear_local(&self) {
        self.local.clear();
        self.local_keys.clear();
    }

    async fn refresh_shared(&self, flag_key: &str) {
        if let Some(shared) = &self.shared {
            let key = flag_key.to_string();
            let fresh = load_snapshot(self.store.clone(), key.clone(), self.store_timeout).await;
            let written = match fresh {
                Ok(Some(snapshot)) => shared.put(&key, &snapshot).await,
                // gone, or unreadable right now: the next reader reloads
                Ok(None) | Err(_) => shared.invalidate(&key).await,
            };
            if let Err(e) = written {
                warn!(flag_key = %flag_key, error = %e, "failed to refresh shared cache entry");
                inc(
                    FLAG_CACHE_INVALIDATION_ERRORS_COUNTER,
                    &[label("tier", "shared")],
                    1,
                );
            }
        }
        if let Some(shared_keys) = &self.shared_keys {
            if let Err(e) = shared_keys.invalidate(&ALL_FLAG_KEYS.to_string()).await {
                warn!(error = %e, "failed to clear shared flag key list");
                inc(
                    FLAG_CACHE_INVALIDATION_ERRORS_COUNTER,
                    &[label("tier", "shared")],
                    1,
                );
            }
        }
    }
}

async fn load_snapshot(
    store: Arc<dyn FlagStore>,
    flag_key: String,
    timeout: Duration,
) -> Result<Option<FlagSnapshot>, StoreError> {
    let _timer = timing_guard(STORE_READ_TIME, &[]);
    inc(STORE_READS_COUNTER, &[label("kind", "snapshot")], 1);
    tokio::time::timeout(timeout, store.get_snapshot(&flag_key))
        .await
        .map_err(|_| StoreError::Timeout)?
}

async fn load_flag_keys(
    store: Arc<dyn FlagStore>,
    timeout: Duration,
) -> Result<Option<Vec<String>>, StoreError> {
    inc(STORE_READS_COUNTER, &[label("kind", "flag_keys")], 1);
    let keys = tokio::time::timeout(timeout, store.list_flag_keys())
        .await
        .map_err(|_| StoreError::Timeout)??;
    Ok(Some(keys))
}

fn record_cache_source(source: CacheSource) {
    match source {
        CacheSource::SharedCache => inc(FLAG_CACHE_HIT_COUNTER, &[label("tier", "shared")], 1),
        other => inc(FLAG_CACHE_MISS_COUNTER, &[label("source", other)], 1),
    }
}

fn record_store_error(flag_key: &str, error: &StoreError) {
    let kind = match error {
        StoreError::Timeout => "timeout",
        StoreError::Unavailable(_) => "unavailable",
        StoreError::Corrupt(_) => "corrupt",
        _ => "other",
    };
    warn!(flag_key = %flag_key, error = %error, "store read failed");
    inc(STORE_READ_ERRORS_COUNTER, &[label("kind", kind)], 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ActorContext, AuditAction, AuditRecord};
    use crate::store::InMemoryFlagStore;
    use crate::test_utils::{boolean_flag, StaleReadStore};
    use chrono::Utc;
    use common_redis::MockRedisClient;

    fn settings() -> FlagCacheSettings {
        FlagCacheSettings {
            local_ttl: Duration::from_secs(60),
            local_max_entries: 100,
            shared_ttl_seconds: 60,
            store_timeout: Duration::from_millis(50),
            shared_settle_delay: Duration::from_millis(60),
        }
    }

    async fn seeded_store(keys: &[&str]) -> Arc<InMemoryFlagStore> {
        let store = Arc::new(InMemoryFlagStore::new());
        for key in keys {
            let audit = AuditRecord::new(key, AuditAction::Created, &ActorContext::new("t"), Utc::now());
            store.insert_flag(&boolean_flag(key, true), &audit).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_local_tier_answers_after_first_read() {
        let store = seeded_store(&["f"]).await;
        let cache = FlagCache::new(store.clone(), None, &settings());

        assert!(cache.get_snapshot("f").await.unwrap().is_some());
        store.set_unavailable(true);
        // served locally, the store is not consulted
        assert!(cache.get_snapshot("f").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_absence_is_cached_locally() {
        let store = seeded_store(&[]).await;
        let cache = FlagCache::new(store.clone(), None, &settings());

        assert!(cache.get_snapshot("missing").await.unwrap().is_none());
        store.set_unavailable(true);
        assert!(cache.get_snapshot("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shared_tier_is_populated_and_read_by_other_instances() {
        let store = seeded_store(&["f"]).await;
        let redis = MockRedisClient::new();
        let first = FlagCache::new(store.clone(), Some(Arc::new(redis.clone())), &settings());
        let second = FlagCache::new(store.clone(), Some(Arc::new(redis.clone())), &settings());

        first.get_snapshot("f").await.unwrap();
        assert!(redis.stored_value("flag_engine:flag:f").is_some());

        store.set_unavailable(true);
        let snapshot = second.get_snapshot("f").await.unwrap().unwrap();
        assert_eq!(snapshot.definition.key, "f");
    }

    fn cached_version(redis: &MockRedisClient, flag_key: &str) -> Option<i64> {
        let raw = redis.stored_value(&format!("{FLAG_CACHE_PREFIX}{flag_key}"))?;
        let snapshot: FlagSnapshot = serde_json::from_str(&raw).unwrap();
        Some(snapshot.definition.version)
    }

    async fn commit_version_two(store: &InMemoryFlagStore, flag_key: &str) {
        let mut next = boolean_flag(flag_key, false);
        next.version = 2;
        let audit = AuditRecord::new(flag_key, AuditAction::Updated, &ActorContext::new("t"), Utc::now());
        store.update_flag(&next, 1, &audit).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_overwrites_shared_and_drops_local() {
        let store = seeded_store(&["f"]).await;
        let redis = MockRedisClient::new();
        let cache = FlagCache::new(store.clone(), Some(Arc::new(redis.clone())), &settings());

        cache.get_snapshot("f").await.unwrap();
        commit_version_two(&store, "f").await;
        cache.refresh("f").await;
        assert_eq!(cached_version(&redis, "f"), Some(2));

        store.set_unavailable(true);
        // served by the shared tier, the local entry is gone
        let snapshot = cache.get_snapshot("f").await.unwrap().unwrap();
        assert_eq!(snapshot.definition.version, 2);
    }

    #[tokio::test]
    async fn test_refresh_without_store_clears_shared() {
        let store = seeded_store(&["f"]).await;
        let redis = MockRedisClient::new();
        let cache = FlagCache::new(store.clone(), Some(Arc::new(redis.clone())), &settings());

        cache.get_snapshot("f").await.unwrap();
        store.set_unavailable(true);
        cache.refresh("f").await;
        assert_eq!(cached_version(&redis, "f"), None);

        assert!(matches!(
            cache.get_snapshot("f").await,
            Err(StoreError::Unavailable(_))
        ));
        // the last-known copy survives invalidation
        assert!(cache.last_known("f").is_some());
    }

    #[tokio::test]
    async fn test_settle_repairs_a_stale_write_back() {
        let store = seeded_store(&["f"]).await;
        let redis = MockRedisClient::new();
        let slow = Arc::new(StaleReadStore::new(store.clone(), Duration::from_millis(30)));
        slow.delay_snapshots(true);
        let reader = Arc::new(FlagCache::new(slow, Some(Arc::new(redis.clone())), &settings()));
        let writer = FlagCache::new(store.clone(), Some(Arc::new(redis.clone())), &settings());

        // the reader misses the shared tier and reads version 1 from the store
        let stale_read = tokio::spawn({
            let reader = reader.clone();
            async move { reader.get_snapshot("f").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        commit_version_two(&store, "f").await;
        writer.refresh("f").await;
        assert_eq!(cached_version(&redis, "f"), Some(2));

        // its write-back lands after the refresh
        stale_read.await.unwrap().unwrap();
        assert_eq!(cached_version(&redis, "f"), Some(1));

        writer.settle("f").await;
        assert_eq!(cached_version(&redis, "f"), Some(2));
    }

    #[tokio::test]
    async fn test_clear_local_drops_every_entry() {
        let store = seeded_store(&["a", "b"]).await;
        let cache = FlagCache::new(store.clone(), None, &settings());
        cache.get_snapshot("a").await.unwrap();
        cache.get_snapshot("b").await.unwrap();
        cache.flag_keys().await.unwrap();

        store.set_unavailable(true);
        cache.clear_local();

        assert!(cache.get_snapshot("a").await.is_err());
        assert!(cache.get_snapshot("b").await.is_err());
        assert!(cache.flag_keys().await.is_err());
        assert!(cache.last_known("a").is_some());
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = seeded_store(&["f"]).await;
        store.set_read_delay(Duration::from_millis(500));
        let cache = FlagCache::new(store, None, &settings());

        assert_eq!(cache.get_snapshot("f").await, Err(StoreError::Timeout));
    }

    #[tokio::test]
    async fn test_redis_outage_falls_back_to_store() {
        let store = seeded_store(&["f"]).await;
        let redis = MockRedisClient::new();
        redis.set_unavailable(true);
        let cache = FlagCache::new(store, Some(Arc::new(redis)), &settings());

        assert!(cache.get_snapshot("f").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flag_keys_are_cached_and_invalidated() {
        let store = seeded_store(&["a", "b"]).await;
        let cache = FlagCache::new(store.clone(), None, &settings());
        assert_eq!(cache.flag_keys().await.unwrap(), vec!["a", "b"]);

        let audit = AuditRecord::new("c", AuditAction::Created, &ActorContext::new("t"), Utc::now());
        store.insert_flag(&boolean_flag("c", true), &audit).await.unwrap();
        assert_eq!(cache.flag_keys().await.unwrap(), vec!["a", "b"]);

        cache.invalidate_local("c");
        assert_eq!(cache.flag_keys().await.unwrap(), vec!["a", "b", "c"]);
    }
}
