use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    audit::{AuditRecord, AuditTrail},
    flags::flag_models::{FlagDefinition, FlagOverride, FlagSnapshot},
    rollout::RolloutPlan,
    store::{FlagStore, RolloutPlanStore, StoreError},
};

#[derive(Default)]
struct State {
    flags: HashMap<String, FlagDefinition>,
    overrides: HashMap<Uuid, FlagOverride>,
    audit: AuditTrail,
    plans: HashMap<String, RolloutPlan>,
    guardrails: HashMap<String, String>,
}

/// Mutex-guarded store for tests and single-node runs. Each mutation and its
/// audit record are applied inside one critical section.
///
/// Outages can be simulated with [`set_unavailable`](Self::set_unavailable)
/// and slow reads with [`set_read_delay`](Self::set_read_delay).
#[derive(Default)]
pub struct InMemoryFlagStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl InMemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay applied to flag reads before they touch the data.
    pub fn set_read_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn audit_len(&self) -> usize {
        self.lock().map(|state| state.audit.len()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    async fn simulate_read_latency(&self) {
        let millis = self.read_delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    async fn get_snapshot(&self, flag_key: &str) -> Result<Option<FlagSnapshot>, StoreError> {
        self.simulate_read_latency().await;
        let state = self.lock()?;
        let Some(definition) = state.flags.get(flag_key).cloned() else {
            return Ok(None);
        };
        let mut overrides: Vec<FlagOverride> = state
            .overrides
            .values()
            .filter(|ov| ov.flag_key == flag_key)
            .cloned()
            .collect();
        overrides.sort_by_key(|ov| ov.created_at);

        Ok(Some(FlagSnapshot {
            definition,
            overrides,
        }))
    }

    async fn list_flag_keys(&self) -> Result<Vec<String>, StoreError> {
        self.simulate_read_latency().await;
        let state = self.lock()?;
        let mut keys: Vec<String> = state
            .flags
            .values()
            .filter(|flag| !flag.is_archived)
            .map(|flag| flag.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_flag(&self, flag_key: &str) -> Result<Option<FlagDefinition>, StoreError> {
        Ok(self.lock()?.flags.get(flag_key).cloned())
    }

    async fn insert_flag(
        &self,
        flag: &FlagDefinition,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.flags.contains_key(&flag.key) {
            return Err(StoreError::DuplicateKey(flag.key.clone()));
        }
        state.flags.insert(flag.key.clone(), flag.clone());
        state.audit.append(audit.clone());
        Ok(())
    }

    async fn update_flag(
        &self,
        flag: &FlagDefinition,
        expected_version: i64,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let current = state
            .flags
            .get(&flag.key)
            .ok_or_else(|| StoreError::NotFound(format!("flag {}", flag.key)))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        state.flags.insert(flag.key.clone(), flag.clone());
        state.audit.append(audit.clone());
        Ok(())
    }

    async fn upsert_override(
        &self,
        flag_override: &FlagOverride,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.flags.contains_key(&flag_override.flag_key) {
            return Err(StoreError::NotFound(format!(
                "flag {}",
                flag_override.flag_key
            )));
        }
        state.overrides.retain(|_, existing| {
            existing.flag_key != flag_override.flag_key || existing.target != flag_override.target
        });
        state
            .overrides
            .insert(flag_override.id, flag_override.clone());
        state.audit.append(audit.clone());
        Ok(())
    }

    async fn get_override(&self, id: Uuid) -> Result<Option<FlagOverride>, StoreError> {
        Ok(self.lock()?.overrides.get(&id).cloned())
    }

    async fn delete_override(&self, id: Uuid, audit: &AuditRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.overrides.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("override {id}")));
        }
        state.audit.append(audit.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        flag_key: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self.lock()?.audit.list(flag_key, limit))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

#[async_trait]
impl RolloutPlanStore for InMemoryFlagStore {
    async fn save_plan(
        &self,
        plan: &RolloutPlan,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let stored_version = state.plans.get(&plan.flag_key).map(|stored| stored.version);
        if stored_version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version.unwrap_or_default(),
                actual: stored_version.unwrap_or_default(),
            });
        }
        state.plans.insert(plan.flag_key.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, flag_key: &str) -> Result<Option<RolloutPlan>, StoreError> {
        Ok(self.lock()?.plans.get(flag_key).cloned())
    }

    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<RolloutPlan>, StoreError> {
        let state = self.lock()?;
        let mut due: Vec<RolloutPlan> = state
            .plans
            .values()
            .filter(|plan| plan.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|plan| plan.next_advance_at());
        Ok(due)
    }

    async fn raise_guardrail(&self, flag_key: &str, reason: &str) -> Result<(), StoreError> {
        self.lock()?
            .guardrails
            .insert(flag_key.to_string(), reason.to_string());
        Ok(())
    }

    async fn pending_guardrail(&self, flag_key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.guardrails.get(flag_key).cloned())
    }

    async fn clear_guardrail(&self, flag_key: &str) -> Result<(), StoreError> {
        self.lock()?.guardrails.remove(flag_key);
        Ok(())
    }
}
