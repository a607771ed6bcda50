use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::errors::FlagError;

/// Thirty days.
pub const MAX_STEP_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

/// Where a staged rollout currently stands.
///
/// `Staged` means `steps[current_index]` has been applied to the flag and the
/// next step becomes due at `next_advance_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RolloutState {
    Idle,
    Staged {
        current_index: usize,
        next_advance_at: DateTime<Utc>,
    },
    Completed,
    Aborted {
        reason: String,
    },
}

/// A persisted staged rollout for one percentage flag, e.g. 10 -> 25 -> 50 -> 100.
///
/// `version` goes up with every state transition and plan saves are
/// compare-and-set on it, so a writer holding an old copy cannot overwrite a
/// newer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub flag_key: String,
    pub steps: Vec<u8>,
    pub step_interval_secs: u64,
    pub state: RolloutState,
    #[serde(default)]
    pub version: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn validate_steps(steps: &[u8]) -> Result<(), FlagError> {
    if steps.is_empty() {
        return Err(FlagError::Validation(
            "a rollout needs at least one step".to_string(),
        ));
    }
    if let Some(step) = steps.iter().find(|s| **s > 100) {
        return Err(FlagError::Validation(format!(
            "rollout steps must be within 0..=100, got {step}"
        )));
    }
    if steps.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(FlagError::Validation(
            "rollout steps must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}

impl RolloutPlan {
    /// A plan that has not applied anything yet.
    pub fn new(
        flag_key: &str,
        steps: Vec<u8>,
        step_interval_secs: u64,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, FlagError> {
        validate_steps(&steps)?;
        if step_interval_secs == 0 || step_interval_secs > MAX_STEP_INTERVAL_SECS {
            return Err(FlagError::Validation(format!(
                "step_interval_secs must be within 1..={MAX_STEP_INTERVAL_SECS}"
            )));
        }

        Ok(Self {
            flag_key: flag_key.to_string(),
            steps,
            step_interval_secs,
            state: RolloutState::Idle,
            version: 0,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, RolloutState::Staged { .. })
    }

    pub fn next_advance_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            RolloutState::Staged {
                next_advance_at, ..
            } => Some(next_advance_at),
            _ => None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_advance_at().is_some_and(|at| now >= at)
    }

    /// Percentage the plan has most recently applied.
    pub fn current_percentage(&self) -> Option<u8> {
        match self.state {
            RolloutState::Staged { current_index, .. } => self.steps.get(current_index).copied(),
            RolloutState::Completed => self.steps.last().copied(),
            RolloutState::Idle | RolloutState::Aborted { .. } => None,
        }
    }

    /// Percentage the next transition will apply, if there is one.
    pub fn next_percentage(&self) -> Option<u8> {
        match self.state {
            RolloutState::Idle => self.steps.first().copied(),
            RolloutState::Staged { current_index, .. } => self.steps.get(current_index + 1).copied(),
            RolloutState::Completed | RolloutState::Aborted { .. } => None,
        }
    }

    /// Move to the next step, after its percentage has been applied to the
    /// flag. The final step completes the plan.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        let next_index = match self.state {
            RolloutState::Idle => 0,
            RolloutState::Staged { current_index, .. } => current_index + 1,
            RolloutState::Completed | RolloutState::Aborted { .. } => return,
        };

        self.state = if next_index + 1 >= self.steps.len() {
            RolloutState::Completed
        } else {
            RolloutState::Staged {
                current_index: next_index,
                next_advance_at: now + self.step_interval(),
            }
        };
        self.version += 1;
        self.updated_at = now;
    }

    /// Returns false if the plan was not in progress.
    pub fn abort(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if !matches!(self.state, RolloutState::Idle | RolloutState::Staged { .. }) {
            return false;
        }
        self.state = RolloutState::Aborted {
            reason: reason.to_string(),
        };
        self.version += 1;
        self.updated_at = now;
        true
    }

    fn step_interval(&self) -> Duration {
        let secs = self.step_interval_secs.min(MAX_STEP_INTERVAL_SECS);
        Duration::seconds(i64::try_from(secs).unwrap_or_default())
    }
}
