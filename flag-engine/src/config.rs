use std::net::SocketAddr;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use once_cell::sync::Lazy;

use crate::cache::FlagCacheSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl From<FlexBool> for bool {
    fn from(flex: FlexBool) -> Self {
        flex.0
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3001")]
    pub address: SocketAddr,

    // Empty selects the in-memory store
    #[envconfig(default = "")]
    pub database_url: String,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "1")]
    pub acquire_timeout_secs: u64,

    // Empty disables the shared cache tier and uses an in-process invalidation bus
    #[envconfig(default = "")]
    pub redis_url: String,

    #[envconfig(default = "100")]
    pub redis_response_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub redis_connection_timeout_ms: u64,

    #[envconfig(default = "5")]
    pub local_cache_ttl_seconds: u64,

    #[envconfig(default = "10000")]
    pub local_cache_max_entries: u64,

    #[envconfig(default = "60")]
    pub shared_cache_ttl_seconds: u64,

    #[envconfig(default = "100")]
    pub store_timeout_ms: u64,

    #[envconfig(default = "flag_engine:invalidations")]
    pub invalidation_channel: String,

    #[envconfig(default = "1000")]
    pub invalidation_reconnect_backoff_ms: u64,

    #[envconfig(default = "30")]
    pub rollout_tick_interval_secs: u64,

    #[envconfig(default = "1000")]
    pub max_concurrency: usize,

    #[envconfig(default = "false")]
    pub enable_metrics: bool,

    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: FlexBool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "flag-engine")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub otel_log_level: tracing::Level,

    #[envconfig(default = "3")]
    pub otel_export_timeout_secs: u64,
}

impl Config {
    pub fn default_test_config() -> Self {
        Self {
            address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
            database_url: "".to_string(),
            max_pg_connections: 10,
            acquire_timeout_secs: 1,
            redis_url: "".to_string(),
            redis_response_timeout_ms: 100,
            redis_connection_timeout_ms: 5000,
            local_cache_ttl_seconds: 5,
            local_cache_max_entries: 10_000,
            shared_cache_ttl_seconds: 60,
            store_timeout_ms: 100,
            invalidation_channel: "flag_engine:invalidations".to_string(),
            invalidation_reconnect_backoff_ms: 50,
            rollout_tick_interval_secs: 30,
            max_concurrency: 1000,
            enable_metrics: false,
            debug: FlexBool(false),
            otel_url: None,
            otel_sampling_rate: 1.0,
            otel_service_name: "flag-engine".to_string(),
            otel_log_level: tracing::Level::INFO,
            otel_export_timeout_secs: 3,
        }
    }

    pub fn database_url(&self) -> Option<&str> {
        Some(self.database_url.as_str()).filter(|url| !url.is_empty())
    }

    pub fn redis_url(&self) -> Option<&str> {
        Some(self.redis_url.as_str()).filter(|url| !url.is_empty())
    }

    pub fn cache_settings(&self) -> FlagCacheSettings {
        FlagCacheSettings {
            local_ttl: Duration::from_secs(self.local_cache_ttl_seconds),
            local_max_entries: self.local_cache_max_entries,
            shared_ttl_seconds: self.shared_cache_ttl_seconds,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            // shared lookup, store read, write-back
            shared_settle_delay: Duration::from_millis(
                self.store_timeout_ms + 2 * self.redis_response_timeout_ms,
            ),
        }
    }

    pub fn rollout_tick_interval(&self) -> Duration {
        Duration::from_secs(self.rollout_tick_interval_secs)
    }

    pub fn invalidation_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.invalidation_reconnect_backoff_ms)
    }
}

pub static DEFAULT_TEST_CONFIG: Lazy<Config> = Lazy::new(Config::default_test_config);
