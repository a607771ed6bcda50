//! Read-through cache over a shared Redis tier.
//!
//! Lookups go to Redis first and fall back to a caller-supplied loader. Values
//! the loader finds are written back with the configured TTL. Redis trouble
//! never fails a lookup: corrupted entries are reloaded and overwritten, and
//! when Redis itself is down the loader is used directly without caching.

use crate::{CacheConfig, CacheResult, CacheSource};
use common_redis::{Client as RedisClient, CustomRedisError};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

pub struct ReadThroughCache {
    redis: Arc<dyn RedisClient + Send + Sync>,
    config: CacheConfig,
}

impl ReadThroughCache {
    pub fn new(redis: Arc<dyn RedisClient + Send + Sync>, config: CacheConfig) -> Self {
        Self { redis, config }
    }

    /// Get a value from Redis or load it with `loader`.
    ///
    /// The loader returns `Ok(None)` when the item does not exist. Absence is
    /// not written to Redis. Loader errors are returned as-is and nothing is
    /// cached.
    pub async fn get_or_load<K, V, E, F, Fut>(
        &self,
        key: &K,
        loader: F,
    ) -> Result<CacheResult<V>, E>
    where
        K: Display + Send + Sync,
        V: Serialize + for<'de> Deserialize<'de> + Send + Sync,
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let cache_key = self.build_cache_key(key);

        let miss_source = match self.get_from_redis(&cache_key).await {
            Ok(cached_value) => {
                tracing::debug!("Shared cache hit for key: {}", key);
                return Ok(CacheResult::found(cached_value, CacheSource::SharedCache));
            }
            Err(CustomRedisError::NotFound) => CacheSource::LoaderCacheMiss,
            Err(CustomRedisError::ParseError(err)) => {
                tracing::warn!(
                    "Cache corruption detected for key {}: {}. Will refresh from source.",
                    key,
                    err
                );
                CacheSource::LoaderCacheCorrupted
            }
            Err(err) => {
                tracing::warn!(
                    "Redis infrastructure issue for key {}: {:?}. Operating without cache.",
                    key,
                    err
                );
                CacheSource::LoaderRedisUnavailable
            }
        };

        match loader(key).await? {
            Some(value) => {
                if miss_source != CacheSource::LoaderRedisUnavailable {
                    if let Err(redis_err) = self.set_in_redis(&cache_key, &value).await {
                        tracing::warn!("Failed to update cache for key {}: {:?}", key, redis_err);
                    }
                }
                Ok(CacheResult::found(value, miss_source))
            }
            None => Ok(CacheResult::not_found(miss_source)),
        }
    }

    /// Overwrite the cached value for `key` with the configured TTL.
    pub async fn put<K, V>(&self, key: &K, value: &V) -> Result<(), CustomRedisError>
    where
        K: Display,
        V: Serialize,
    {
        let cache_key = self.build_cache_key(key);
        self.set_in_redis(&cache_key, value).await
    }

    /// Remove a key from Redis so the next lookup reloads it.
    pub async fn invalidate<K>(&self, key: &K) -> Result<(), CustomRedisError>
    where
        K: Display,
    {
        let cache_key = self.build_cache_key(key);
        match self.redis.del(cache_key).await {
            Ok(()) | Err(CustomRedisError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn build_cache_key<K>(&self, key: &K) -> String
    where
        K: Display,
    {
        format!("{}{}", self.config.cache_prefix, key)
    }

    async fn get_from_redis<V>(&self, cache_key: &str) -> Result<V, CustomRedisError>
    where
        V: for<'de> Deserialize<'de>,
    {
        let serialized_value = self.redis.get(cache_key.to_string()).await?;
        let value = serde_json::from_str(&serialized_value).map_err(|e| {
            CustomRedisError::ParseError(format!("Failed to deserialize cached value: {e}"))
        })?;
        Ok(value)
    }

    async fn set_in_redis<V>(&self, cache_key: &str, value: &V) -> Result<(), CustomRedisError>
    where
        V: Serialize,
    {
        let serialized_value = serde_json::to_string(value).map_err(|e| {
            CustomRedisError::ParseError(format!("Failed to serialize value for cache: {e}"))
        })?;

        match self.config.ttl_seconds {
            Some(ttl) => {
                self.redis
                    .setex(cache_key.to_string(), serialized_value, ttl)
                    .await
            }
            None => self.redis.set(cache_key.to_string(), serialized_value).await,
        }
    }
}
