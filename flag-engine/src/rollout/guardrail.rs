use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{RolloutPlanStore, StoreError};

/// External signal that can halt a staged rollout, e.g. an error-rate alarm.
#[async_trait]
pub trait RolloutGuardrail: Send + Sync {
    /// Reason of a pending abort signal for `flag_key`, if one is raised.
    async fn abort_reason(&self, flag_key: &str) -> Result<Option<String>, StoreError>;

    /// Drops a pending signal, once acted on or when a fresh rollout starts.
    async fn clear(&self, flag_key: &str) -> Result<(), StoreError>;
}

/// Guardrail tripped through the admin API. Signals live in the plan store,
/// so a trip on one instance stops a tick running on any other.
pub struct GuardrailSignals {
    plans: Arc<dyn RolloutPlanStore>,
}

impl GuardrailSignals {
    pub fn new(plans: Arc<dyn RolloutPlanStore>) -> Self {
        Self { plans }
    }

    /// Later trips replace the reason of an earlier, unconsumed one.
    pub async fn trip(&self, flag_key: &str, reason: &str) -> Result<(), StoreError> {
        self.plans.raise_guardrail(flag_key, reason).await
    }
}

#[async_trait]
impl RolloutGuardrail for GuardrailSignals {
    async fn abort_reason(&self, flag_key: &str) -> Result<Option<String>, StoreError> {
        self.plans.pending_guardrail(flag_key).await
    }

    async fn clear(&self, flag_key: &str) -> Result<(), StoreError> {
        self.plans.clear_guardrail(flag_key).await
    }
}
