use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    audit::{ActorContext, AuditAction, AuditRecord},
    flags::flag_models::{FlagDefinition, FlagOverride, FlagSnapshot, FlagValue, OverrideTarget},
    rollout::RolloutPlan,
    store::{FlagStore, RolloutPlanStore, StoreError},
};

#[derive(Debug, sqlx::FromRow)]
struct OverrideRow {
    id: Uuid,
    flag_key: String,
    tenant_id: Option<String>,
    user_id: Option<String>,
    value: Json<FlagValue>,
    expires_at: Option<DateTime<Utc>>,
    reason: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OverrideRow> for FlagOverride {
    type Error = StoreError;

    fn try_from(row: OverrideRow) -> Result<Self, Self::Error> {
        let target = OverrideTarget::from_parts(row.tenant_id, row.user_id)
            .map_err(|e| StoreError::Corrupt(format!("override {}: {e}", row.id)))?;
        Ok(FlagOverride {
            id: row.id,
            flag_key: row.flag_key,
            target,
            value: row.value.0,
            expires_at: row.expires_at,
            reason: row.reason,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    flag_key: String,
    action: String,
    old_value: Option<serde_json::Value>,
    new_value: Option<serde_json::Value>,
    actor: String,
    tenant_id: Option<String>,
    ip: Option<String>,
    user_agent: Option<String>,
    reason: Option<String>,
    emergency: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let action = AuditAction::from_str(&row.action)
            .map_err(|_| StoreError::Corrupt(format!("unknown audit action {}", row.action)))?;
        Ok(AuditRecord {
            id: row.id,
            flag_key: row.flag_key,
            action,
            old_value: row.old_value,
            new_value: row.new_value,
            actor: ActorContext {
                actor: row.actor,
                tenant_id: row.tenant_id,
                ip: row.ip,
                user_agent: row.user_agent,
            },
            reason: row.reason,
            emergency: row.emergency,
            created_at: row.created_at,
        })
    }
}

/// Postgres-backed store. Every mutation and its audit record share one
/// transaction.
#[derive(Clone)]
pub struct PgFlagStore {
    pool: PgPool,
}

impl PgFlagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("failed to run migrations: {e}")))
    }

    async fn append_audit(
        tx: &mut Transaction<'_, Postgres>,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flag_audit_log
                (id, flag_key, action, old_value, new_value, actor, tenant_id, ip, user_agent, reason, emergency, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(audit.id)
        .bind(&audit.flag_key)
        .bind(audit.action.to_string())
        .bind(&audit.old_value)
        .bind(&audit.new_value)
        .bind(&audit.actor.actor)
        .bind(&audit.actor.tenant_id)
        .bind(&audit.actor.ip)
        .bind(&audit.actor.user_agent)
        .bind(&audit.reason)
        .bind(audit.emergency)
        .bind(audit.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    async fn get_snapshot(&self, flag_key: &str) -> Result<Option<FlagSnapshot>, StoreError> {
        let Some(definition) = self.get_flag(flag_key).await? else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT id, flag_key, tenant_id, user_id, value, expires_at, reason, created_by, created_at
            FROM flag_overrides
            WHERE flag_key = $1
            ORDER BY created_at
            "#,
        )
        .bind(flag_key)
        .fetch_all(&self.pool)
        .await?;

        let overrides = rows
            .into_iter()
            .map(FlagOverride::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(FlagSnapshot {
            definition,
            overrides,
        }))
    }

    async fn list_flag_keys(&self) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM flag_definitions WHERE NOT is_archived ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn get_flag(&self, flag_key: &str) -> Result<Option<FlagDefinition>, StoreError> {
        let row: Option<Json<FlagDefinition>> =
            sqlx::query_scalar("SELECT definition FROM flag_definitions WHERE key = $1")
                .bind(flag_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|definition| definition.0))
    }

    async fn insert_flag(
        &self,
        flag: &FlagDefinition,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO flag_definitions
                (key, name, flag_type, salt, is_enabled, is_archived, version, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&flag.key)
        .bind(&flag.name)
        .bind(flag.flag_type().to_string())
        .bind(&flag.salt)
        .bind(flag.is_enabled)
        .bind(flag.is_archived)
        .bind(flag.version)
        .bind(Json(flag))
        .bind(flag.created_at)
        .bind(flag.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateKey(flag.key.clone()));
        }

        Self::append_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_flag(
        &self,
        flag: &FlagDefinition,
        expected_version: i64,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // salt and key are never written here
        let updated = sqlx::query(
            r#"
            UPDATE flag_definitions
            SET name = $2, is_enabled = $3, is_archived = $4, version = $5, definition = $6, updated_at = $7
            WHERE key = $1 AND version = $8
            "#,
        )
        .bind(&flag.key)
        .bind(&flag.name)
        .bind(flag.is_enabled)
        .bind(flag.is_archived)
        .bind(flag.version)
        .bind(Json(flag))
        .bind(flag.updated_at)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM flag_definitions WHERE key = $1")
                    .bind(&flag.key)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match actual {
                Some(actual) => StoreError::VersionConflict {
                    expected: expected_version,
                    actual,
                },
                None => StoreError::NotFound(format!("flag {}", flag.key)),
            });
        }

        Self::append_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_override(
        &self,
        flag_override: &FlagOverride,
        audit: &AuditRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // lock the parent row so a concurrent archive cannot interleave
        let exists: Option<String> =
            sqlx::query_scalar("SELECT key FROM flag_definitions WHERE key = $1 FOR SHARE")
                .bind(&flag_override.flag_key)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!(
                "flag {}",
                flag_override.flag_key
            )));
        }

        let tenant_id = flag_override.target.tenant_id();
        let user_id = flag_override.target.user_id();

        // replaces the existing override for the target in one statement, so
        // concurrent adds for the same target cannot both insert
        let upsert = format!(
            r#"
            INSERT INTO flag_overrides
                (id, flag_key, tenant_id, user_id, value, expires_at, reason, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT {} DO UPDATE
            SET id = EXCLUDED.id, value = EXCLUDED.value, expires_at = EXCLUDED.expires_at,
                reason = EXCLUDED.reason, created_by = EXCLUDED.created_by, created_at = EXCLUDED.created_at
            "#,
            override_target_constraint(&flag_override.target)
        );
        sqlx::query(&upsert)
            .bind(flag_override.id)
            .bind(&flag_override.flag_key)
            .bind(tenant_id)
            .bind(user_id)
            .bind(Json(&flag_override.value))
            .bind(flag_override.expires_at)
            .bind(&flag_override.reason)
            .bind(&flag_override.created_by)
            .bind(flag_override.created_at)
            .execute(&mut *tx)
            .await?;

        Self::append_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_override(&self, id: Uuid) -> Result<Option<FlagOverride>, StoreError> {
        let row = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT id, flag_key, tenant_id, user_id, value, expires_at, reason, created_by, created_at
            FROM flag_overrides
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FlagOverride::try_from).transpose()
    }

    async fn delete_override(&self, id: Uuid, audit: &AuditRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM flag_overrides WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("override {id}")));
        }

        Self::append_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_audit(
        &self,
        flag_key: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, flag_key, action, old_value, new_value, actor, tenant_id, ip, user_agent, reason, emergency, created_at
            FROM flag_audit_log
            WHERE flag_key = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(flag_key)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RolloutPlanStore for PgFlagStore {
    async fn save_plan(
        &self,
        plan: &RolloutPlan,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        let written = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO flag_rollout_plans (flag_key, plan, next_advance_at, updated_at, version)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (flag_key) DO NOTHING
                    "#,
                )
                .bind(&plan.flag_key)
                .bind(Json(plan))
                .bind(plan.next_advance_at())
                .bind(plan.updated_at)
                .bind(plan.version)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE flag_rollout_plans
                    SET plan = $2, next_advance_at = $3, updated_at = $4, version = $5
                    WHERE flag_key = $1 AND version = $6
                    "#,
                )
                .bind(&plan.flag_key)
                .bind(Json(plan))
                .bind(plan.next_advance_at())
                .bind(plan.updated_at)
                .bind(plan.version)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };

        if written.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM flag_rollout_plans WHERE flag_key = $1")
                    .bind(&plan.flag_key)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(StoreError::VersionConflict {
                expected: expected_version.unwrap_or_default(),
                actual: actual.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn get_plan(&self, flag_key: &str) -> Result<Option<RolloutPlan>, StoreError> {
        let row: Option<Json<RolloutPlan>> =
            sqlx::query_scalar("SELECT plan FROM flag_rollout_plans WHERE flag_key = $1")
                .bind(flag_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|plan| plan.0))
    }

    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<RolloutPlan>, StoreError> {
        let rows: Vec<Json<RolloutPlan>> = sqlx::query_scalar(
            r#"
            SELECT plan FROM flag_rollout_plans
            WHERE next_advance_at IS NOT NULL AND next_advance_at <= $1
            ORDER BY next_advance_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|plan| plan.0).collect())
    }

    async fn raise_guardrail(&self, flag_key: &str, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flag_rollout_guardrails (flag_key, reason, raised_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (flag_key) DO UPDATE
            SET reason = EXCLUDED.reason, raised_at = EXCLUDED.raised_at
            "#,
        )
        .bind(flag_key)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_guardrail(&self, flag_key: &str) -> Result<Option<String>, StoreError> {
        let reason: Option<String> =
            sqlx::query_scalar("SELECT reason FROM flag_rollout_guardrails WHERE flag_key = $1")
                .bind(flag_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(reason)
    }

    async fn clear_guardrail(&self, flag_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flag_rollout_guardrails WHERE flag_key = $1")
            .bind(flag_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Unique constraint an override upsert conflicts on, one per target kind.
fn override_target_constraint(target: &OverrideTarget) -> &'static str {
    match target {
        OverrideTarget::TenantId(_) => "flag_overrides_tenant_unique",
        OverrideTarget::UserId(_) => "flag_overrides_user_unique",
    }
}
