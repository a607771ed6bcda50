//! Process-wide wiring.
//!
//! A [`Registry`] is built once at start, owns every handle the engine
//! needs and is shared by `Arc` with the HTTP layer. Nothing in the crate
//! reaches for global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_redis::{Client as RedisClient, CustomRedisError, RedisClient as RealRedisClient};
use futures::future::join_all;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    admin::FlagAdmin,
    cache::{
        ChangeNotifier, FlagCache, InvalidationListener, LocalChangeNotifier, RedisChangeNotifier,
    },
    config::Config,
    flags::{
        evaluation_source::EvaluationSource,
        flag_matching::evaluate,
        flag_models::{EvaluationContext, EvaluationResult},
    },
    metrics::{
        consts::{
            FLAG_EVALUATE_ALL_TIME, FLAG_EVALUATIONS_COUNTER, FLAG_EVALUATION_TIME,
            FLAG_FAIL_OPEN_COUNTER,
        },
        utils::{inc, label, timing_guard},
    },
    rollout::{GuardrailSignals, RolloutController},
    store::{FlagStore, InMemoryFlagStore, PgFlagStore, RolloutPlanStore, StoreError},
};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to open the flag store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to connect to redis: {0}")]
    Redis(#[from] CustomRedisError),
}

/// External collaborators of a registry. Several registries built from
/// clones of the same backends behave like separate instances of one
/// deployment.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn FlagStore>,
    pub plans: Arc<dyn RolloutPlanStore>,
    pub redis: Option<Arc<dyn RedisClient + Send + Sync>>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl Backends {
    /// In-memory store and in-process bus, no shared cache tier.
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryFlagStore::new());
        Self {
            store: store.clone(),
            plans: store,
            redis: None,
            notifier: Arc::new(LocalChangeNotifier::new()),
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        let (store, plans): (Arc<dyn FlagStore>, Arc<dyn RolloutPlanStore>) =
            match config.database_url() {
                Some(url) => {
                    let store = PgFlagStore::connect(
                        url,
                        config.max_pg_connections,
                        Duration::from_secs(config.acquire_timeout_secs),
                    )
                    .await?;
                    store.migrate().await?;
                    let store = Arc::new(store);
                    (store.clone(), store)
                }
                None => {
                    warn!("DATABASE_URL is not set, flags are kept in memory and lost on restart");
                    let store = Arc::new(InMemoryFlagStore::new());
                    (store.clone(), store)
                }
            };

        let (redis, notifier): (
            Option<Arc<dyn RedisClient + Send + Sync>>,
            Arc<dyn ChangeNotifier>,
        ) = match config.redis_url() {
            Some(url) => {
                let redis: Arc<dyn RedisClient + Send + Sync> = Arc::new(
                    RealRedisClient::with_config(
                        url.to_string(),
                        Some(Duration::from_millis(config.redis_response_timeout_ms)),
                        Some(Duration::from_millis(config.redis_connection_timeout_ms)),
                    )
                    .await?,
                );
                let notifier = Arc::new(RedisChangeNotifier::new(
                    redis.clone(),
                    config.invalidation_channel.clone(),
                ));
                (Some(redis), notifier)
            }
            None => {
                info!("REDIS_URL is not set, running without a shared cache tier");
                (None, Arc::new(LocalChangeNotifier::new()))
            }
        };

        Ok(Self {
            store,
            plans,
            redis,
            notifier,
        })
    }
}

pub struct Registry {
    instance_id: String,
    store: Arc<dyn FlagStore>,
    cache: Arc<FlagCache>,
    notifier: Arc<dyn ChangeNotifier>,
    admin: Arc<FlagAdmin>,
    rollouts: Arc<RolloutController>,
    guardrails: Arc<GuardrailSignals>,
    reconnect_backoff: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Registry {
    pub fn new(instance_id: impl Into<String>, backends: Backends, config: &Config) -> Self {
        let instance_id = instance_id.into();
        let cache = Arc::new(FlagCache::new(
            backends.store.clone(),
            backends.redis,
            &config.cache_settings(),
        ));
        let admin = Arc::new(FlagAdmin::new(
            backends.store.clone(),
            backends.plans.clone(),
            cache.clone(),
            backends.notifier.clone(),
            &instance_id,
        ));
        let guardrails = Arc::new(GuardrailSignals::new(backends.plans.clone()));
        let rollouts = Arc::new(RolloutController::new(
            backends.plans,
            admin.clone(),
            guardrails.clone(),
            config.rollout_tick_interval(),
        ));

        Self {
            instance_id,
            store: backends.store,
            cache,
            notifier: backends.notifier,
            admin,
            rollouts,
            guardrails,
            reconnect_backoff: config.invalidation_reconnect_backoff(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        let backends = Backends::from_config(config).await?;
        let instance_id = Uuid::now_v7().to_string();
        info!(instance_id = %instance_id, "flag engine registry created");
        Ok(Self::new(instance_id, backends, config))
    }

    /// Subscribe to invalidations and start the rollout tick loop. The
    /// subscription is in place when this returns.
    pub async fn start(&self) {
        let listener = InvalidationListener::new(
            self.notifier.clone(),
            self.cache.clone(),
            &self.instance_id,
            self.reconnect_backoff,
        );
        let initial = listener.subscribe().await;
        self.tasks.spawn(listener.run(initial, self.cancel.clone()));
        self.tasks
            .spawn(self.rollouts.clone().run(self.cancel.clone()));
    }

    /// Stop background loops and wait for pending invalidation broadcasts.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.admin.wait_for_pending().await;
        info!(instance_id = %self.instance_id, "flag engine registry stopped");
    }

    pub async fn evaluate(&self, flag_key: &str, context: &EvaluationContext) -> EvaluationResult {
        let _timer = timing_guard(FLAG_EVALUATION_TIME, &[]);
        let result = self.evaluate_at(flag_key, context, Utc::now()).await;
        inc(
            FLAG_EVALUATIONS_COUNTER,
            &[label("source", result.source)],
            1,
        );
        result
    }

    /// Every non-archived flag, keyed by flag key.
    pub async fn evaluate_all(
        &self,
        context: &EvaluationContext,
    ) -> HashMap<String, EvaluationResult> {
        let _timer = timing_guard(FLAG_EVALUATE_ALL_TIME, &[]);
        let keys = match self.cache.flag_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to list flags, using the last known list");
                inc(FLAG_FAIL_OPEN_COUNTER, &[label("operation", "evaluate_all")], 1);
                self.cache.last_known_flag_keys().unwrap_or_default()
            }
        };

        let results = join_all(keys.iter().map(|key| self.evaluate(key, context))).await;
        keys.into_iter().zip(results).collect()
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn admin(&self) -> &FlagAdmin {
        &self.admin
    }

    pub fn rollouts(&self) -> &RolloutController {
        &self.rollouts
    }

    pub fn guardrails(&self) -> &GuardrailSignals {
        &self.guardrails
    }

    pub fn cache(&self) -> &FlagCache {
        &self.cache
    }

    async fn evaluate_at(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        match self.cache.get_snapshot(flag_key).await {
            Ok(snapshot) => evaluate(snapshot.as_ref(), flag_key, context, now),
            Err(e) => {
                let last_known = self.cache.last_known(flag_key);
                warn!(
                    flag_key = %flag_key,
                    error = %e,
                    has_last_known = last_known.is_some(),
                    "flag read failed, failing open"
                );
                inc(
                    FLAG_FAIL_OPEN_COUNTER,
                    &[label("last_known", last_known.is_some())],
                    1,
                );
                match last_known {
                    Some(snapshot) => EvaluationResult {
                        source: EvaluationSource::StoreUnavailable,
                        ..evaluate(Some(&snapshot), flag_key, context, now)
                    },
                    None => EvaluationResult::fallback(
                        flag_key,
                        EvaluationSource::StoreUnavailable,
                        now,
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ActorContext;
    use crate::config::DEFAULT_TEST_CONFIG;
    use crate::flags::flag_models::{FlagPatch, FlagValue};
    use crate::test_utils::{new_boolean_flag, new_percentage_flag};

    async fn registry_with_store() -> (Registry, Arc<InMemoryFlagStore>) {
        let store = Arc::new(InMemoryFlagStore::new());
        let backends = Backends {
            store: store.clone(),
            plans: store.clone(),
            redis: None,
            notifier: Arc::new(LocalChangeNotifier::new()),
        };
        let registry = Registry::new("test-instance", backends, &DEFAULT_TEST_CONFIG);
        registry.start().await;
        (registry, store)
    }

    #[tokio::test]
    async fn test_unknown_flag_evaluates_to_default() {
        let (registry, _) = registry_with_store().await;
        let result = registry
            .evaluate("missing", &EvaluationContext::for_user("u1"))
            .await;

        assert_eq!(result.value, FlagValue::Boolean(false));
        assert_eq!(result.source, EvaluationSource::Default);
        assert_eq!(result.version, None);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_fails_open_with_last_known_value() {
        let (registry, store) = registry_with_store().await;
        registry
            .admin()
            .create_flag(new_boolean_flag("checkout", true), &ActorContext::new("admin"))
            .await
            .unwrap();

        let ctx = EvaluationContext::for_user("u1");
        let first = registry.evaluate("checkout", &ctx).await;
        assert_eq!(first.value, FlagValue::Boolean(true));

        store.set_unavailable(true);
        registry.cache().invalidate_local("checkout");
        let degraded = registry.evaluate("checkout", &ctx).await;

        assert_eq!(degraded.value, FlagValue::Boolean(true));
        assert_eq!(degraded.source, EvaluationSource::StoreUnavailable);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_fails_open_to_false_without_last_known_value() {
        let (registry, store) = registry_with_store().await;
        store.set_unavailable(true);

        let result = registry
            .evaluate("checkout", &EvaluationContext::for_user("u1"))
            .await;
        assert_eq!(result.value, FlagValue::Boolean(false));
        assert_eq!(result.source, EvaluationSource::StoreUnavailable);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_store_times_out_and_fails_open() {
        let (registry, store) = registry_with_store().await;
        store.set_read_delay(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let result = registry
            .evaluate("checkout", &EvaluationContext::for_user("u1"))
            .await;

        assert_eq!(result.source, EvaluationSource::StoreUnavailable);
        assert!(started.elapsed() < Duration::from_millis(400));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_evaluate_all_skips_archived_flags() {
        let (registry, _) = registry_with_store().await;
        let actor = ActorContext::new("admin");
        let admin = registry.admin();
        admin
            .create_flag(new_boolean_flag("a", true), &actor)
            .await
            .unwrap();
        admin
            .create_flag(new_percentage_flag("b", 100), &actor)
            .await
            .unwrap();
        let archived = admin
            .create_flag(new_boolean_flag("c", true), &actor)
            .await
            .unwrap();
        admin
            .update_flag(
                "c",
                &FlagPatch {
                    is_archived: Some(true),
                    ..Default::default()
                },
                archived.version,
                &actor,
            )
            .await
            .unwrap();

        let results = registry
            .evaluate_all(&EvaluationContext::for_user("u1"))
            .await;

        let mut keys: Vec<_> = results.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(results["b"].source, EvaluationSource::Rollout);
        assert_eq!(results["b"].value, FlagValue::Boolean(true));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_reflects_store_health() {
        let (registry, store) = registry_with_store().await;
        assert!(registry.ping().await.is_ok());
        store.set_unavailable(true);
        assert!(registry.ping().await.is_err());
        registry.shutdown().await;
    }
}
