//! Durable storage for flag definitions, overrides, audit records and rollout
//! plans.
//!
//! Every mutating call takes the [`AuditRecord`] describing it and persists
//! both in one atomic step, so a mutation is never visible without its audit
//! entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    audit::AuditRecord,
    flags::flag_models::{FlagDefinition, FlagOverride, FlagSnapshot},
    rollout::RolloutPlan,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryFlagStore;
pub use postgres::PgFlagStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("flag {0} already exists")]
    DuplicateKey(String),
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },
    #[error("store operation timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Definition plus all of its overrides, expired ones included.
    async fn get_snapshot(&self, flag_key: &str) -> Result<Option<FlagSnapshot>, StoreError>;

    /// Keys of every flag that is not archived.
    async fn list_flag_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn get_flag(&self, flag_key: &str) -> Result<Option<FlagDefinition>, StoreError>;

    /// Fails with `DuplicateKey` if the key is taken, archived flags included.
    async fn insert_flag(&self, flag: &FlagDefinition, audit: &AuditRecord)
        -> Result<(), StoreError>;

    /// Compare-and-set on `version`: the stored flag must still be at
    /// `expected_version`, otherwise `VersionConflict` is returned and nothing
    /// is written.
    async fn update_flag(
        &self,
        flag: &FlagDefinition,
        expected_version: i64,
        audit: &AuditRecord,
    ) -> Result<(), StoreError>;

    /// Insert an override, replacing any existing one for the same flag and
    /// target.
    async fn upsert_override(
        &self,
        flag_override: &FlagOverride,
        audit: &AuditRecord,
    ) -> Result<(), StoreError>;

    async fn get_override(&self, id: Uuid) -> Result<Option<FlagOverride>, StoreError>;

    async fn delete_override(&self, id: Uuid, audit: &AuditRecord) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_audit(&self, flag_key: &str, limit: usize)
        -> Result<Vec<AuditRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Persistence for the rollout controller, so staged rollouts survive restarts
/// and every instance sees the same plans and guardrail signals.
#[async_trait]
pub trait RolloutPlanStore: Send + Sync {
    /// Compare-and-set on the plan version. `None` expects no plan for the
    /// flag yet, `Some(v)` expects the stored plan to be at `v`. Anything else
    /// is a `VersionConflict` and nothing is written.
    async fn save_plan(
        &self,
        plan: &RolloutPlan,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn get_plan(&self, flag_key: &str) -> Result<Option<RolloutPlan>, StoreError>;

    /// Staged plans whose next advance is at or before `now`.
    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<RolloutPlan>, StoreError>;

    /// Raise an abort signal for the flag's rollout. A later signal replaces
    /// the reason of an earlier one that has not been acted on.
    async fn raise_guardrail(&self, flag_key: &str, reason: &str) -> Result<(), StoreError>;

    async fn pending_guardrail(&self, flag_key: &str) -> Result<Option<String>, StoreError>;

    async fn clear_guardrail(&self, flag_key: &str) -> Result<(), StoreError>;
}
