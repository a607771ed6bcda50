//! Two-tier caching shared by services in this workspace.
//!
//! - [`LocalCache`]: per-process moka cache with a short TTL, caching both
//!   hits and known-absent keys, plus a last-known-value store for degraded
//!   operation.
//! - [`ReadThroughCache`]: Redis-backed tier with a loader fallback that keeps
//!   working when Redis does not.
//!
//! # Example
//!
//! ```rust,ignore
//! use common_cache::{CacheConfig, CacheSource, ReadThroughCache};
//!
//! let cache = ReadThroughCache::new(redis, CacheConfig::with_ttl("my_data:", 60));
//!
//! let result = cache
//!     .get_or_load(&key, |key| async { load_from_source(key).await })
//!     .await?;
//!
//! if result.source == CacheSource::SharedCache {
//!     println!("Cache hit!");
//! }
//! ```

pub mod local;
pub mod read_through;
pub mod types;

pub use local::LocalCache;
pub use read_through::ReadThroughCache;
pub use types::{CacheConfig, CacheResult, CacheSource};
