use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    admin::FlagAdmin,
    api::errors::FlagError,
    audit::ActorContext,
    flags::flag_models::FlagType,
    metrics::{
        consts::{
            ROLLOUT_ABORTS_COUNTER, ROLLOUT_ADVANCES_COUNTER, ROLLOUT_TICKS_COUNTER,
            ROLLOUT_TICK_ERRORS_COUNTER,
        },
        utils::{inc, label},
    },
    rollout::{guardrail::RolloutGuardrail, plan::RolloutPlan},
    store::{RolloutPlanStore, StoreError},
};

const CONTROLLER_ACTOR: &str = "rollout-controller";

/// Advances staged rollouts from a periodic tick.
///
/// All state lives in the [`RolloutPlanStore`], so a restarted process picks
/// up where the last one left off. Percentage changes go through the normal
/// mutation path and are audited as `rollout_changed`.
pub struct RolloutController {
    plans: Arc<dyn RolloutPlanStore>,
    admin: Arc<FlagAdmin>,
    guardrail: Arc<dyn RolloutGuardrail>,
    tick_interval: Duration,
}

impl RolloutController {
    pub fn new(
        plans: Arc<dyn RolloutPlanStore>,
        admin: Arc<FlagAdmin>,
        guardrail: Arc<dyn RolloutGuardrail>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            plans,
            admin,
            guardrail,
            tick_interval,
        }
    }

    /// Start a staged rollout, replacing any previous plan for the flag. The
    /// first step is applied immediately and a stale guardrail signal is
    /// dropped.
    pub async fn start_rollout(
        &self,
        flag_key: &str,
        steps: Vec<u8>,
        step_interval_secs: u64,
        actor: &ActorContext,
    ) -> Result<RolloutPlan, FlagError> {
        let flag = self.admin.get_flag(flag_key).await?;
        if flag.flag_type() != FlagType::Percentage {
            return Err(FlagError::Validation(format!(
                "staged rollouts need a percentage flag, {flag_key} is a {} flag",
                flag.flag_type()
            )));
        }
        if flag.is_archived || !flag.is_enabled {
            return Err(FlagError::Validation(format!(
                "flag {flag_key} must be enabled to start a rollout"
            )));
        }

        let previous = self.plans.get_plan(flag_key).await?;
        let expected_version = previous.map(|plan| plan.version);

        let now = Utc::now();
        let mut plan = RolloutPlan::new(flag_key, steps, step_interval_secs, &actor.actor, now)?;
        plan.version = expected_version.unwrap_or_default();
        self.guardrail.clear(flag_key).await?;

        if let Some(first) = plan.next_percentage() {
            self.admin
                .set_rollout_percentage(flag_key, first, actor)
                .await?;
        }
        plan.advance(now);
        self.plans.save_plan(&plan, expected_version).await?;

        info!(flag_key = %flag_key, steps = ?plan.steps, actor = %actor.actor, "rollout started");
        Ok(plan)
    }

    pub async fn get_plan(&self, flag_key: &str) -> Result<RolloutPlan, FlagError> {
        self.plans
            .get_plan(flag_key)
            .await?
            .ok_or_else(|| FlagError::NotFound(format!("rollout plan for {flag_key}")))
    }

    /// Stop a staged rollout where it is. The flag keeps its current
    /// percentage.
    pub async fn abort(
        &self,
        flag_key: &str,
        reason: &str,
        actor: &ActorContext,
    ) -> Result<RolloutPlan, FlagError> {
        let mut plan = self.get_plan(flag_key).await?;
        let expected_version = plan.version;
        if !plan.abort(reason, Utc::now()) {
            return Err(FlagError::Validation(format!(
                "rollout for {flag_key} is not in progress"
            )));
        }
        self.plans.save_plan(&plan, Some(expected_version)).await?;

        info!(flag_key = %flag_key, reason = %reason, actor = %actor.actor, "rollout aborted");
        inc(ROLLOUT_ABORTS_COUNTER, &[label("cause", "admin")], 1);
        Ok(plan)
    }

    /// Advance every plan that is due at `now`. Returns how many plans moved
    /// (advanced or aborted). Running it again with nothing due is a no-op.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        inc(ROLLOUT_TICKS_COUNTER, &[], 1);
        let due = self.plans.due_plans(now).await?;

        let mut moved = 0;
        for plan in due {
            let flag_key = plan.flag_key.clone();
            match self.advance_plan(plan, now).await {
                Ok(()) => moved += 1,
                Err(FlagError::Conflict { .. }) => {
                    // aborted or restarted elsewhere since it was read
                    info!(flag_key = %flag_key, "rollout plan changed concurrently, skipped");
                }
                Err(e) => {
                    // left as is, retried on the next tick
                    warn!(flag_key = %flag_key, error = %e, "failed to advance rollout");
                    inc(ROLLOUT_TICK_ERRORS_COUNTER, &[], 1);
                }
            }
        }
        Ok(moved)
    }

    /// Tick every `tick_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rollout controller stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        warn!(error = %e, "rollout tick failed");
                        inc(ROLLOUT_TICK_ERRORS_COUNTER, &[], 1);
                    }
                }
            }
        }
    }

    async fn advance_plan(&self, mut plan: RolloutPlan, now: DateTime<Utc>) -> Result<(), FlagError> {
        let flag_key = plan.flag_key.clone();

        if let Some(reason) = self.guardrail.abort_reason(&flag_key).await? {
            let reason = format!("guardrail: {reason}");
            self.abort_from_tick(plan, &reason, "guardrail", now).await?;
            self.guardrail.clear(&flag_key).await?;
            return Ok(());
        }

        let flag = match self.admin.get_flag(&flag_key).await {
            Ok(flag) => flag,
            Err(FlagError::NotFound(_)) => {
                return self.abort_from_tick(plan, "flag no longer exists", "flag_state", now).await
            }
            Err(e) => return Err(e),
        };
        if flag.is_archived || !flag.is_enabled {
            return self
                .abort_from_tick(plan, "flag was disabled or archived", "flag_state", now)
                .await;
        }

        if let Some(target) = plan.next_percentage() {
            // set_rollout_percentage is a no-op when a previous tick already
            // applied this step but failed to save the plan
            let actor = ActorContext::system(CONTROLLER_ACTOR);
            match self.admin.set_rollout_percentage(&flag_key, target, &actor).await {
                Ok(_) => {}
                // disabled since it was read above, the kill switch wins
                Err(FlagError::Inactive(_)) => {
                    return self
                        .abort_from_tick(plan, "flag was disabled or archived", "flag_state", now)
                        .await
                }
                Err(e) => return Err(e),
            }
            info!(flag_key = %flag_key, percentage = target, "rollout advanced");
            inc(ROLLOUT_ADVANCES_COUNTER, &[label("step", target)], 1);
        }

        let expected_version = plan.version;
        plan.advance(now);
        self.plans.save_plan(&plan, Some(expected_version)).await?;
        Ok(())
    }

    async fn abort_from_tick(
        &self,
        mut plan: RolloutPlan,
        reason: &str,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<(), FlagError> {
        let expected_version = plan.version;
        plan.abort(reason, now);
        self.plans.save_plan(&plan, Some(expected_version)).await?;
        warn!(flag_key = %plan.flag_key, reason = %reason, "rollout aborted");
        inc(ROLLOUT_ABORTS_COUNTER, &[label("cause", cause)], 1);
        Ok(())
    }
}
