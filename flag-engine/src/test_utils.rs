use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_redis::MockRedisClient;
use uuid::Uuid;

use crate::{
    audit::AuditRecord,
    cache::{LocalChangeNotifier, RedisChangeNotifier},
    config::{Config, DEFAULT_TEST_CONFIG},
    flags::flag_models::{
        FlagDefinition, FlagKind, FlagOverride, FlagSnapshot, FlagValue, FlagVariant, NewFlag,
        OverrideTarget,
    },
    registry::{Backends, Registry},
    rollout::RolloutPlan,
    store::{FlagStore, InMemoryFlagStore, RolloutPlanStore, StoreError},
};

pub const TEST_SALT: &str = "test-salt";

fn new_flag(key: &str, kind: FlagKind) -> NewFlag {
    NewFlag {
        key: key.to_string(),
        name: key.to_string(),
        description: String::new(),
        category: None,
        kind,
        enabled_tenants: BTreeSet::new(),
        disabled_tenants: BTreeSet::new(),
        enabled_users: BTreeSet::new(),
        schedule_start: None,
        schedule_end: None,
        is_enabled: true,
    }
}

pub fn new_boolean_flag(key: &str, default_value: bool) -> NewFlag {
    new_flag(key, FlagKind::Boolean { default_value })
}

pub fn new_percentage_flag(key: &str, percentage: u8) -> NewFlag {
    new_flag(
        key,
        FlagKind::Percentage {
            default_value: false,
            percentage,
        },
    )
}

pub fn new_variant_flag(key: &str, variants: &[(&str, u32)]) -> NewFlag {
    new_flag(
        key,
        FlagKind::Variant {
            default_value: "control".to_string(),
            variants: variants
                .iter()
                .map(|(key, weight)| FlagVariant {
                    key: key.to_string(),
                    weight: *weight,
                })
                .collect(),
        },
    )
}

/// Stored definitions with a fixed salt, so bucket assignments in tests are
/// stable across runs.
pub fn boolean_flag(key: &str, default_value: bool) -> FlagDefinition {
    new_boolean_flag(key, default_value).into_definition(TEST_SALT.to_string(), Utc::now())
}

pub fn percentage_flag(key: &str, percentage: u8) -> FlagDefinition {
    new_percentage_flag(key, percentage).into_definition(TEST_SALT.to_string(), Utc::now())
}

pub fn variant_flag(key: &str, variants: &[(&str, u32)]) -> FlagDefinition {
    new_variant_flag(key, variants).into_definition(TEST_SALT.to_string(), Utc::now())
}

pub fn snapshot(definition: FlagDefinition, overrides: Vec<FlagOverride>) -> FlagSnapshot {
    FlagSnapshot {
        definition,
        overrides,
    }
}

fn flag_override(flag_key: &str, target: OverrideTarget, value: bool) -> FlagOverride {
    FlagOverride {
        id: Uuid::new_v4(),
        flag_key: flag_key.to_string(),
        target,
        value: FlagValue::Boolean(value),
        expires_at: None,
        reason: None,
        created_by: "test".to_string(),
        created_at: Utc::now(),
    }
}

pub fn user_override(flag_key: &str, user_id: &str, value: bool) -> FlagOverride {
    flag_override(flag_key, OverrideTarget::UserId(user_id.to_string()), value)
}

pub fn tenant_override(flag_key: &str, tenant_id: &str, value: bool) -> FlagOverride {
    flag_override(flag_key, OverrideTarget::TenantId(tenant_id.to_string()), value)
}

/// Backends shared by every instance built from the cluster: one store, one
/// fake Redis and one invalidation bus.
#[derive(Clone)]
pub struct TestCluster {
    pub store: Arc<InMemoryFlagStore>,
    pub redis: Option<MockRedisClient>,
    notifier: LocalChangeNotifier,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    /// No shared cache tier, in-process bus.
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryFlagStore::new()),
            redis: None,
            notifier: LocalChangeNotifier::new(),
        }
    }

    /// Shared cache tier and invalidation bus on a mock Redis.
    pub fn with_redis() -> Self {
        Self {
            redis: Some(MockRedisClient::new()),
            ..Self::new()
        }
    }

    pub fn backends(&self) -> Backends {
        match &self.redis {
            Some(redis) => {
                let redis = Arc::new(redis.clone());
                Backends {
                    store: self.store.clone(),
                    plans: self.store.clone(),
                    redis: Some(redis.clone()),
                    notifier: Arc::new(RedisChangeNotifier::new(
                        redis,
                        DEFAULT_TEST_CONFIG.invalidation_channel.clone(),
                    )),
                }
            }
            None => Backends {
                store: self.store.clone(),
                plans: self.store.clone(),
                redis: None,
                notifier: Arc::new(self.notifier.clone()),
            },
        }
    }

    pub async fn instance(&self, instance_id: &str) -> TestInstance {
        self.instance_with_config(instance_id, &DEFAULT_TEST_CONFIG)
            .await
    }

    pub async fn instance_with_config(&self, instance_id: &str, config: &Config) -> TestInstance {
        let registry = Arc::new(Registry::new(instance_id, self.backends(), config));
        registry.start().await;
        TestInstance {
            registry,
            store: self.store.clone(),
        }
    }
}

/// A started registry over in-memory backends.
pub struct TestInstance {
    pub registry: Arc<Registry>,
    pub store: Arc<InMemoryFlagStore>,
}

impl TestInstance {
    pub async fn new() -> Self {
        TestCluster::new().instance("test-instance").await
    }
}

/// Store whose selected reads see the data on time but hand it back only
/// after `delay`, so a caller can act on a value that has since changed.
pub struct StaleReadStore {
    inner: Arc<InMemoryFlagStore>,
    delay: Duration,
    delay_snapshots: AtomicBool,
    delayed_flag_read: AtomicUsize,
    flag_reads: AtomicUsize,
}

impl StaleReadStore {
    pub fn new(inner: Arc<InMemoryFlagStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            delay_snapshots: AtomicBool::new(false),
            delayed_flag_read: AtomicUsize::new(0),
            flag_reads: AtomicUsize::new(0),
        }
    }

    pub fn delay_snapshots(&self, delay: bool) {
        self.delay_snapshots.store(delay, Ordering::SeqCst);
    }

    /// Delay one `get_flag` call: the first one after `skip` more reads.
    pub fn delay_flag_read_after(&self, skip: usize) {
        let current = self.flag_reads.load(Ordering::SeqCst);
        self.delayed_flag_read
            .store(current + skip + 1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlagStore for StaleReadStore {
    async fn get_snapshot(&self, flag_key: &str) -> Result<Option<FlagSnapshot>, StoreError> {
        let snapshot = self.inner.get_snapshot(flag_key).await;
        if self.delay_snapshots.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        snapshot
    }

    async fn list_flag_keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_flag_keys().await
    }

    async fn get_flag(&self, flag_key: &str) -> Result<Option<FlagDefinition>, StoreError> {
        let read = self.flag_reads.fetch_add(1, Ordering::SeqCst) + 1;
        let flag = self.inner.get_flag(flag_key).await;
        if read == self.delayed_flag_read.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        flag
    }

    async fn insert_flag(&self, flag: &FlagDefinition, audit: &AuditRecord)
        -> Result<(), StoreError> {
        self.inner.insert_flag(flag, audit).await
    }

    async fn update_flag(
        &self,
        flag: &FlagDefinition,
        expected_version: i64,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        self.inner.update_flag(flag, expected_version, audit).await
    }

    async fn upsert_override(
        &self,
        flag_override: &FlagOverride,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        self.inner.upsert_override(flag_override, audit).await
    }

    async fn get_override(&self, id: Uuid) -> Result<Option<FlagOverride>, StoreError> {
        self.inner.get_override(id).await
    }

    async fn delete_override(&self, id: Uuid, audit: &AuditRecord) -> Result<(), StoreError> {
        self.inner.delete_override(id, audit).await
    }

    async fn list_audit(&self, flag_key: &str, limit: usize)
        -> Result<Vec<AuditRecord>, StoreError> {
        self.inner.list_audit(flag_key, limit).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

#[async_trait]
impl RolloutPlanStore for StaleReadStore {
    async fn save_plan(
        &self,
        plan: &RolloutPlan,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        self.inner.save_plan(plan, expected_version).await
    }

    async fn get_plan(&self, flag_key: &str) -> Result<Option<RolloutPlan>, StoreError> {
        self.inner.get_plan(flag_key).await
    }

    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<RolloutPlan>, StoreError> {
        self.inner.due_plans(now).await
    }

    async fn raise_guardrail(&self, flag_key: &str, reason: &str) -> Result<(), StoreError> {
        self.inner.raise_guardrail(flag_key, reason).await
    }

    async fn pending_guardrail(&self, flag_key: &str) -> Result<Option<String>, StoreError> {
        self.inner.pending_guardrail(flag_key).await
    }

    async fn clear_guardrail(&self, flag_key: &str) -> Result<(), StoreError> {
        self.inner.clear_guardrail(flag_key).await
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
