//! Administrative mutations.
//!
//! Every mutation goes store first (with its audit record, atomically), then
//! overwrites the shared cache entry synchronously, then broadcasts the
//! invalidation in the background. Once in-flight shared-tier loads have had
//! time to finish, the shared entry is rewritten a second time.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api::errors::FlagError,
    audit::{ActorContext, AuditAction, AuditRecord},
    cache::{ChangeNotifier, FlagCache, InvalidationMessage},
    flags::flag_models::{
        generate_salt, validate_flag_key, FlagDefinition, FlagOverride, FlagPatch, NewFlag,
        NewOverride, OverrideTarget,
    },
    metrics::{
        consts::{
            FLAG_MUTATIONS_COUNTER, FLAG_MUTATION_CONFLICTS_COUNTER,
            INVALIDATIONS_PUBLISHED_COUNTER, INVALIDATIONS_PUBLISH_FAILED_COUNTER,
            KILL_SWITCH_COUNTER,
        },
        utils::{inc, label},
    },
    store::{FlagStore, RolloutPlanStore, StoreError},
};

/// Read-modify-write operations the engine performs on its own behalf retry
/// this many times on a version conflict before giving up.
pub const MAX_CONFLICT_RETRIES: usize = 5;

pub const MAX_AUDIT_LIMIT: usize = 1000;

pub struct FlagAdmin {
    store: Arc<dyn FlagStore>,
    plans: Arc<dyn RolloutPlanStore>,
    cache: Arc<FlagCache>,
    notifier: Arc<dyn ChangeNotifier>,
    instance_id: String,
    tasks: TaskTracker,
}

impl FlagAdmin {
    pub fn new(
        store: Arc<dyn FlagStore>,
        plans: Arc<dyn RolloutPlanStore>,
        cache: Arc<FlagCache>,
        notifier: Arc<dyn ChangeNotifier>,
        instance_id: &str,
    ) -> Self {
        Self {
            store,
            plans,
            cache,
            notifier,
            instance_id: instance_id.to_string(),
            tasks: TaskTracker::new(),
        }
    }

    pub async fn create_flag(
        &self,
        new_flag: NewFlag,
        actor: &ActorContext,
    ) -> Result<FlagDefinition, FlagError> {
        validate_flag_key(&new_flag.key)?;
        let now = Utc::now();
        let mut flag = new_flag.into_definition(generate_salt(), now);
        flag.validate()?;
        flag.record_change(AuditAction::Created, &actor.actor, now);

        let audit = AuditRecord::new(&flag.key, AuditAction::Created, actor, now)
            .with_values(None::<&FlagDefinition>, Some(&flag));
        self.store.insert_flag(&flag, &audit).await?;

        info!(flag_key = %flag.key, flag_type = %flag.flag_type(), actor = %actor.actor, "flag created");
        self.after_mutation(&flag.key, AuditAction::Created).await;
        Ok(flag)
    }

    pub async fn get_flag(&self, flag_key: &str) -> Result<FlagDefinition, FlagError> {
        self.store
            .get_flag(flag_key)
            .await?
            .ok_or_else(|| FlagError::NotFound(format!("flag {flag_key}")))
    }

    /// Optimistic update: fails with `Conflict` unless the stored flag is
    /// still at `expected_version`.
    pub async fn update_flag(
        &self,
        flag_key: &str,
        patch: &FlagPatch,
        expected_version: i64,
        actor: &ActorContext,
    ) -> Result<FlagDefinition, FlagError> {
        let current = self.get_flag(flag_key).await?;
        if current.version != expected_version {
            inc(FLAG_MUTATION_CONFLICTS_COUNTER, &[], 1);
            return Err(FlagError::Conflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = current.clone();
        next.apply_patch(patch)?;
        next.validate()?;
        let action = derive_action(&current, &next);

        self.commit_update(&current, next, action, actor, None, false)
            .await
    }

    /// Set the rollout percentage, re-reading on conflicts. A no-op when the
    /// flag is already at `percentage`. Fails with `Inactive` once the flag is
    /// disabled or archived, so a kill switch that lands mid-way is never
    /// undone.
    pub async fn set_rollout_percentage(
        &self,
        flag_key: &str,
        percentage: u8,
        actor: &ActorContext,
    ) -> Result<FlagDefinition, FlagError> {
        let mut attempt = 0;
        loop {
            let current = self.get_flag(flag_key).await?;
            if current.is_archived || !current.is_enabled {
                return Err(FlagError::Inactive(format!(
                    "flag {flag_key} is disabled or archived"
                )));
            }
            if current.kind.percentage() == Some(percentage) {
                return Ok(current);
            }

            let mut next = current.clone();
            next.kind.set_percentage(percentage)?;
            next.validate()?;

            match self
                .commit_update(&current, next, AuditAction::RolloutChanged, actor, None, false)
                .await
            {
                Err(FlagError::Conflict { .. }) if attempt < MAX_CONFLICT_RETRIES => attempt += 1,
                other => return other,
            }
        }
    }

    /// Emergency disable: `is_enabled = false` and a zero percentage in one
    /// mutation, audited as an emergency with the given reason. Any staged
    /// rollout of the flag is aborted.
    pub async fn kill_switch(
        &self,
        flag_key: &str,
        reason: &str,
        actor: &ActorContext,
    ) -> Result<FlagDefinition, FlagError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(FlagError::Validation(
                "the kill switch requires a reason".to_string(),
            ));
        }

        let mut attempt = 0;
        let killed = loop {
            let current = self.get_flag(flag_key).await?;
            let mut next = current.clone();
            next.is_enabled = false;
            if next.kind.percentage().is_some() {
                next.kind.set_percentage(0)?;
            }

            match self
                .commit_update(
                    &current,
                    next,
                    AuditAction::Disabled,
                    actor,
                    Some(reason.to_string()),
                    true,
                )
                .await
            {
                Err(FlagError::Conflict { .. }) if attempt < MAX_CONFLICT_RETRIES => attempt += 1,
                other => break other?,
            }
        };

        warn!(flag_key = %flag_key, actor = %actor.actor, reason = %reason, "kill switch engaged");
        inc(KILL_SWITCH_COUNTER, &[], 1);
        self.abort_rollout(flag_key, &format!("kill switch: {reason}"))
            .await;
        Ok(killed)
    }

    pub async fn add_override(
        &self,
        flag_key: &str,
        new_override: NewOverride,
        actor: &ActorContext,
    ) -> Result<FlagOverride, FlagError> {
        let target = OverrideTarget::from_parts(new_override.tenant_id, new_override.user_id)?;
        let flag = self.get_flag(flag_key).await?;
        if !flag.kind.accepts_value(&new_override.value) {
            return Err(FlagError::Validation(format!(
                "override value does not match the {} flag {flag_key}",
                flag.flag_type()
            )));
        }

        let now = Utc::now();
        if new_override.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(FlagError::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }

        let flag_override = FlagOverride {
            id: Uuid::now_v7(),
            flag_key: flag_key.to_string(),
            target,
            value: new_override.value,
            expires_at: new_override.expires_at,
            reason: new_override.reason.clone(),
            created_by: actor.actor.clone(),
            created_at: now,
        };
        let audit = AuditRecord::new(flag_key, AuditAction::OverrideAdded, actor, now)
            .with_values(None::<&FlagOverride>, Some(&flag_override))
            .with_reason(new_override.reason);
        self.store.upsert_override(&flag_override, &audit).await?;

        info!(flag_key = %flag_key, override_id = %flag_override.id, actor = %actor.actor, "override added");
        self.after_mutation(flag_key, AuditAction::OverrideAdded)
            .await;
        Ok(flag_override)
    }

    pub async fn remove_override(&self, id: Uuid, actor: &ActorContext) -> Result<(), FlagError> {
        let existing = self
            .store
            .get_override(id)
            .await?
            .ok_or_else(|| FlagError::NotFound(format!("override {id}")))?;

        let audit = AuditRecord::new(
            &existing.flag_key,
            AuditAction::OverrideRemoved,
            actor,
            Utc::now(),
        )
        .with_values(Some(&existing), None::<&FlagOverride>);
        self.store.delete_override(id, &audit).await?;

        info!(flag_key = %existing.flag_key, override_id = %id, actor = %actor.actor, "override removed");
        self.after_mutation(&existing.flag_key, AuditAction::OverrideRemoved)
            .await;
        Ok(())
    }

    /// Newest first. `limit` is clamped to `1..=MAX_AUDIT_LIMIT`.
    pub async fn list_audit(
        &self,
        flag_key: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, FlagError> {
        // unknown keys are a 404, not an empty list
        self.get_flag(flag_key).await?;
        let limit = limit.clamp(1, MAX_AUDIT_LIMIT);
        Ok(self.store.list_audit(flag_key, limit).await?)
    }

    /// Wait for background invalidation broadcasts to finish.
    pub async fn wait_for_pending(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn commit_update(
        &self,
        current: &FlagDefinition,
        mut next: FlagDefinition,
        action: AuditAction,
        actor: &ActorContext,
        reason: Option<String>,
        emergency: bool,
    ) -> Result<FlagDefinition, FlagError> {
        let now = Utc::now();
        next.version = current.version + 1;
        next.updated_at = now;
        next.record_change(action, &actor.actor, now);

        let mut audit = AuditRecord::new(&next.key, action, actor, now)
            .with_values(Some(current), Some(&next))
            .with_reason(reason);
        if emergency {
            audit = audit.emergency();
        }

        if let Err(e) = self.store.update_flag(&next, current.version, &audit).await {
            if matches!(e, StoreError::VersionConflict { .. }) {
                inc(FLAG_MUTATION_CONFLICTS_COUNTER, &[], 1);
            }
            return Err(e.into());
        }

        info!(flag_key = %next.key, action = %action, version = next.version, actor = %actor.actor, "flag updated");
        self.after_mutation(&next.key, action).await;
        Ok(next)
    }

    async fn abort_rollout(&self, flag_key: &str, reason: &str) {
        for _ in 0..=MAX_CONFLICT_RETRIES {
            let mut plan = match self.plans.get_plan(flag_key).await {
                Ok(Some(plan)) => plan,
                Ok(None) => return,
                Err(e) => {
                    warn!(flag_key = %flag_key, error = %e, "could not load rollout plan to abort");
                    return;
                }
            };

            let expected_version = plan.version;
            if !plan.abort(reason, Utc::now()) {
                return;
            }
            match self.plans.save_plan(&plan, Some(expected_version)).await {
                Ok(()) => {
                    info!(flag_key = %flag_key, reason = %reason, "rollout aborted");
                    return;
                }
                // a tick moved the plan in the meantime, abort the newer state
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => {
                    warn!(flag_key = %flag_key, error = %e, "failed to persist aborted rollout");
                    return;
                }
            }
        }
        warn!(flag_key = %flag_key, "gave up aborting rollout after repeated conflicts");
    }

    async fn after_mutation(&self, flag_key: &str, action: AuditAction) {
        inc(FLAG_MUTATIONS_COUNTER, &[label("action", action)], 1);
        self.cache.refresh(flag_key).await;

        let notifier = self.notifier.clone();
        let cache = self.cache.clone();
        let message = InvalidationMessage::new(flag_key, &self.instance_id);
        self.tasks.spawn(async move {
            match notifier.publish(&message).await {
                Ok(()) => inc(INVALIDATIONS_PUBLISHED_COUNTER, &[], 1),
                Err(e) => {
                    warn!(flag_key = %message.flag_key, error = %e, "failed to broadcast invalidation");
                    inc(INVALIDATIONS_PUBLISH_FAILED_COUNTER, &[], 1);
                }
            }
            cache.settle(&message.flag_key).await;
        });
    }
}

/// Audit action for an update, named after the one thing that changed when
/// only one thing did.
pub fn derive_action(old: &FlagDefinition, new: &FlagDefinition) -> AuditAction {
    let only_changed = |restore: &dyn Fn(&mut FlagDefinition)| {
        let mut candidate = new.clone();
        restore(&mut candidate);
        candidate == *old
    };

    if !old.is_archived
        && new.is_archived
        && only_changed(&|c: &mut FlagDefinition| c.is_archived = old.is_archived)
    {
        return AuditAction::Archived;
    }
    if old.is_enabled != new.is_enabled
        && only_changed(&|c: &mut FlagDefinition| c.is_enabled = old.is_enabled)
    {
        return if new.is_enabled {
            AuditAction::Enabled
        } else {
            AuditAction::Disabled
        };
    }
    if old.kind.percentage() != new.kind.percentage()
        && only_changed(&|c: &mut FlagDefinition| c.kind = old.kind.clone())
    {
        return AuditAction::RolloutChanged;
    }
    AuditAction::Updated
}
