//! Append-only record of flag mutations.
//!
//! One [`AuditRecord`] is written per mutating admin action, in the same
//! store operation as the mutation itself. Evaluations are never audited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    Created,
    Updated,
    Enabled,
    Disabled,
    Archived,
    OverrideAdded,
    OverrideRemoved,
    RolloutChanged,
}

/// Who performed a mutation, and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl ActorContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Default::default()
        }
    }

    /// Actor for mutations the engine performs on its own (rollout ticks).
    pub fn system(component: &str) -> Self {
        Self::new(format!("system:{component}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub flag_key: String,
    pub action: AuditAction,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    #[serde(flatten)]
    pub actor: ActorContext,
    pub reason: Option<String>,
    /// Set on kill switch records.
    pub emergency: bool,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(flag_key: &str, action: AuditAction, actor: &ActorContext, at: DateTime<Utc>) -> Self {
        Self {
            // v7 ids sort by creation time
            id: Uuid::now_v7(),
            flag_key: flag_key.to_string(),
            action,
            old_value: None,
            new_value: None,
            actor: actor.clone(),
            reason: None,
            emergency: false,
            created_at: at,
        }
    }

    pub fn with_values<O, N>(mut self, old: Option<&O>, new: Option<&N>) -> Self
    where
        O: Serialize,
        N: Serialize,
    {
        self.old_value = old.and_then(|v| serde_json::to_value(v).ok());
        self.new_value = new.and_then(|v| serde_json::to_value(v).ok());
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn emergency(mut self) -> Self {
        self.emergency = true;
        self
    }
}

/// In-memory audit log, used by the in-memory store.
#[derive(Debug, Default)]
pub struct AuditTrail {
    records: Vec<AuditRecord>,
}

impl AuditTrail {
    pub fn append(&mut self, record: AuditRecord) {
        self.records.push(record);
    }

    /// Newest first.
    pub fn list(&self, flag_key: &str, limit: usize) -> Vec<AuditRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.flag_key == flag_key)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_is_reverse_chronological_and_filtered() {
        let actor = ActorContext::new("admin");
        let mut trail = AuditTrail::default();
        trail.append(AuditRecord::new("a", AuditAction::Created, &actor, Utc::now()));
        trail.append(AuditRecord::new("b", AuditAction::Created, &actor, Utc::now()));
        trail.append(AuditRecord::new("a", AuditAction::Updated, &actor, Utc::now()));
        trail.append(AuditRecord::new("a", AuditAction::Disabled, &actor, Utc::now()));

        let actions: Vec<AuditAction> = trail.list("a", 10).into_iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Disabled, AuditAction::Updated, AuditAction::Created]
        );
        assert_eq!(trail.list("a", 1).len(), 1);
        assert_eq!(trail.len(), 4);
    }

    #[test]
    fn test_record_serializes_actor_inline() {
        let actor = ActorContext {
            actor: "alice".to_string(),
            tenant_id: Some("t1".to_string()),
            ip: Some("10.0.0.1".to_string()),
            user_agent: Some("curl/8".to_string()),
        };
        let record = AuditRecord::new("f", AuditAction::Disabled, &actor, Utc::now())
            .with_values(Some(&json!({"is_enabled": true})), Some(&json!({"is_enabled": false})))
            .with_reason(Some("incident".to_string()))
            .emergency();

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["actor"], "alice");
        assert_eq!(json["ip"], "10.0.0.1");
        assert_eq!(json["action"], "disabled");
        assert_eq!(json["emergency"], true);
        assert_eq!(json["old_value"]["is_enabled"], true);
    }
}
