use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
    api::errors::FlagError, audit::AuditAction, flags::evaluation_source::EvaluationSource,
};

pub const MAX_CHANGE_HISTORY: usize = 50;
pub const SALT_LENGTH: usize = 16;

static FLAG_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").expect("valid flag key regex"));

pub fn validate_flag_key(key: &str) -> Result<(), FlagError> {
    if FLAG_KEY_REGEX.is_match(key) {
        Ok(())
    } else {
        Err(FlagError::Validation(format!(
            "invalid flag key {key:?}: expected 1-128 characters from [A-Za-z0-9_.-], starting with a letter or digit"
        )))
    }
}

/// Random per-flag salt. Generated once at creation, never regenerated.
pub fn generate_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Boolean(value)
    }
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Boolean(b) => Some(*b),
            FlagValue::String(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlagType {
    Boolean,
    Percentage,
    TenantList,
    UserList,
    Schedule,
    Variant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagVariant {
    pub key: String,
    pub weight: u32,
}

/// Per-type payload of a flag. Each variant carries its own strongly typed
/// default; the evaluation branch is chosen by matching on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlagKind {
    Boolean {
        default_value: bool,
    },
    Percentage {
        default_value: bool,
        #[serde(default)]
        percentage: u8,
    },
    TenantList {
        default_value: bool,
    },
    UserList {
        default_value: bool,
    },
    Schedule {
        default_value: bool,
    },
    Variant {
        default_value: String,
        variants: Vec<FlagVariant>,
    },
}

impl FlagKind {
    pub fn flag_type(&self) -> FlagType {
        match self {
            FlagKind::Boolean { .. } => FlagType::Boolean,
            FlagKind::Percentage { .. } => FlagType::Percentage,
            FlagKind::TenantList { .. } => FlagType::TenantList,
            FlagKind::UserList { .. } => FlagType::UserList,
            FlagKind::Schedule { .. } => FlagType::Schedule,
            FlagKind::Variant { .. } => FlagType::Variant,
        }
    }

    pub fn default_value(&self) -> FlagValue {
        match self {
            FlagKind::Boolean { default_value }
            | FlagKind::Percentage { default_value, .. }
            | FlagKind::TenantList { default_value }
            | FlagKind::UserList { default_value }
            | FlagKind::Schedule { default_value } => FlagValue::Boolean(*default_value),
            FlagKind::Variant { default_value, .. } => FlagValue::String(default_value.clone()),
        }
    }

    pub fn set_default_value(&mut self, value: FlagValue) -> Result<(), FlagError> {
        let flag_type = self.flag_type();
        match (self, value) {
            (FlagKind::Variant { default_value, .. }, FlagValue::String(s)) => {
                *default_value = s;
                Ok(())
            }
            (FlagKind::Variant { .. }, FlagValue::Boolean(_)) => Err(FlagError::Validation(
                "default_value of a variant flag must be a string".to_string(),
            )),
            (
                FlagKind::Boolean { default_value }
                | FlagKind::Percentage { default_value, .. }
                | FlagKind::TenantList { default_value }
                | FlagKind::UserList { default_value }
                | FlagKind::Schedule { default_value },
                FlagValue::Boolean(b),
            ) => {
                *default_value = b;
                Ok(())
            }
            (_, FlagValue::String(_)) => Err(FlagError::Validation(format!(
                "default_value of a {flag_type} flag must be a boolean"
            ))),
        }
    }

    pub fn percentage(&self) -> Option<u8> {
        match self {
            FlagKind::Percentage { percentage, .. } => Some(*percentage),
            _ => None,
        }
    }

    pub fn set_percentage(&mut self, value: u8) -> Result<(), FlagError> {
        match self {
            FlagKind::Percentage { percentage, .. } => {
                *percentage = value;
                Ok(())
            }
            other => Err(FlagError::Validation(format!(
                "percentage can only be set on percentage flags, not {}",
                other.flag_type()
            ))),
        }
    }

    /// Override values must have the same shape as the values the flag
    /// produces: booleans everywhere, plus strings for variant flags.
    pub fn accepts_value(&self, value: &FlagValue) -> bool {
        match self {
            FlagKind::Variant { .. } => true,
            _ => matches!(value, FlagValue::Boolean(_)),
        }
    }

    pub fn validate(&self) -> Result<(), FlagError> {
        match self {
            FlagKind::Percentage { percentage, .. } if *percentage > 100 => Err(
                FlagError::Validation(format!("percentage must be within 0..=100, got {percentage}")),
            ),
            FlagKind::Variant { variants, .. } => {
                if variants.is_empty() {
                    return Err(FlagError::Validation(
                        "variant flags need at least one variant".to_string(),
                    ));
                }
                let mut seen = BTreeSet::new();
                for variant in variants {
                    if variant.key.is_empty() {
                        return Err(FlagError::Validation(
                            "variant keys must not be empty".to_string(),
                        ));
                    }
                    if variant.weight == 0 {
                        return Err(FlagError::Validation(format!(
                            "variant {} must have a positive weight",
                            variant.key
                        )));
                    }
                    if !seen.insert(variant.key.as_str()) {
                        return Err(FlagError::Validation(format!(
                            "duplicate variant key {}",
                            variant.key
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHistoryEntry {
    pub version: i64,
    pub action: AuditAction,
    pub actor: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(flatten)]
    pub kind: FlagKind,
    #[serde(default)]
    pub enabled_tenants: BTreeSet<String>,
    #[serde(default)]
    pub disabled_tenants: BTreeSet<String>,
    #[serde(default)]
    pub enabled_users: BTreeSet<String>,
    pub salt: String,
    #[serde(default)]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule_end: Option<DateTime<Utc>>,
    pub is_enabled: bool,
    #[serde(default)]
    pub is_archived: bool,
    pub version: i64,
    #[serde(default)]
    pub change_history: Vec<ChangeHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlagDefinition {
    pub fn flag_type(&self) -> FlagType {
        self.kind.flag_type()
    }

    pub fn default_value(&self) -> FlagValue {
        self.kind.default_value()
    }

    pub fn validate(&self) -> Result<(), FlagError> {
        validate_flag_key(&self.key)?;
        if self.name.trim().is_empty() {
            return Err(FlagError::Validation("name must not be empty".to_string()));
        }
        if let (Some(start), Some(end)) = (self.schedule_start, self.schedule_end) {
            if start > end {
                return Err(FlagError::Validation(
                    "schedule_start must not be after schedule_end".to_string(),
                ));
            }
        }
        self.kind.validate()
    }

    pub fn record_change(&mut self, action: AuditAction, actor: &str, at: DateTime<Utc>) {
        self.change_history.push(ChangeHistoryEntry {
            version: self.version,
            action,
            actor: actor.to_string(),
            changed_at: at,
        });
        if self.change_history.len() > MAX_CHANGE_HISTORY {
            let excess = self.change_history.len() - MAX_CHANGE_HISTORY;
            self.change_history.drain(..excess);
        }
    }

    pub fn apply_patch(&mut self, patch: &FlagPatch) -> Result<(), FlagError> {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(category) = &patch.category {
            self.category = Some(category.clone());
        }
        if let Some(value) = &patch.default_value {
            self.kind.set_default_value(value.clone())?;
        }
        if let Some(percentage) = patch.percentage {
            self.kind.set_percentage(percentage)?;
        }
        if let Some(new_variants) = &patch.variants {
            match &mut self.kind {
                FlagKind::Variant { variants, .. } => *variants = new_variants.clone(),
                other => {
                    return Err(FlagError::Validation(format!(
                        "variants can only be set on variant flags, not {}",
                        other.flag_type()
                    )))
                }
            }
        }
        if let Some(tenants) = &patch.enabled_tenants {
            self.enabled_tenants = tenants.clone();
        }
        if let Some(tenants) = &patch.disabled_tenants {
            self.disabled_tenants = tenants.clone();
        }
        if let Some(users) = &patch.enabled_users {
            self.enabled_users = users.clone();
        }
        if let Some(window) = &patch.schedule {
            self.schedule_start = window.start;
            self.schedule_end = window.end;
        }
        if let Some(is_enabled) = patch.is_enabled {
            self.is_enabled = is_enabled;
        }
        if let Some(is_archived) = patch.is_archived {
            self.is_archived = is_archived;
        }
        Ok(())
    }
}

/// Input of `CreateFlag`. Targeting fields are optional conveniences; the
/// salt, version and history are assigned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFlag {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(flatten)]
    pub kind: FlagKind,
    #[serde(default)]
    pub enabled_tenants: BTreeSet<String>,
    #[serde(default)]
    pub disabled_tenants: BTreeSet<String>,
    #[serde(default)]
    pub enabled_users: BTreeSet<String>,
    #[serde(default)]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule_end: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl NewFlag {
    pub fn into_definition(self, salt: String, now: DateTime<Utc>) -> FlagDefinition {
        FlagDefinition {
            key: self.key,
            name: self.name,
            description: self.description,
            category: self.category,
            kind: self.kind,
            enabled_tenants: self.enabled_tenants,
            disabled_tenants: self.disabled_tenants,
            enabled_users: self.enabled_users,
            salt,
            schedule_start: self.schedule_start,
            schedule_end: self.schedule_end,
            is_enabled: self.is_enabled,
            is_archived: false,
            version: 1,
            change_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Replaces the whole schedule window; `null` bounds clear it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// Partial update. `key` and `salt` cannot be patched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub default_value: Option<FlagValue>,
    #[serde(default)]
    pub percentage: Option<u8>,
    #[serde(default)]
    pub variants: Option<Vec<FlagVariant>>,
    #[serde(default)]
    pub enabled_tenants: Option<BTreeSet<String>>,
    #[serde(default)]
    pub disabled_tenants: Option<BTreeSet<String>>,
    #[serde(default)]
    pub enabled_users: Option<BTreeSet<String>>,
    #[serde(default)]
    pub schedule: Option<ScheduleWindow>,
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub is_archived: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideTarget {
    TenantId(String),
    UserId(String),
}

impl OverrideTarget {
    /// Exactly one of the two must be given.
    pub fn from_parts(
        tenant_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<OverrideTarget, FlagError> {
        match (tenant_id, user_id) {
            (Some(tenant), None) if !tenant.is_empty() => Ok(OverrideTarget::TenantId(tenant)),
            (None, Some(user)) if !user.is_empty() => Ok(OverrideTarget::UserId(user)),
            (Some(_), Some(_)) => Err(FlagError::Validation(
                "an override targets either tenant_id or user_id, not both".to_string(),
            )),
            _ => Err(FlagError::Validation(
                "an override needs a non-empty tenant_id or user_id".to_string(),
            )),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            OverrideTarget::TenantId(t) => Some(t),
            OverrideTarget::UserId(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            OverrideTarget::UserId(u) => Some(u),
            OverrideTarget::TenantId(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagOverride {
    pub id: Uuid,
    pub flag_key: String,
    #[serde(flatten)]
    pub target: OverrideTarget,
    pub value: FlagValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl FlagOverride {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Input of `AddOverride`, as it arrives over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOverride {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub value: FlagValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The unit that is cached and evaluated: one definition plus its overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub definition: FlagDefinition,
    #[serde(default)]
    pub overrides: Vec<FlagOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Carried through for callers; no targeting rule reads it.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl EvaluationContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Identifier used for bucketing.
    pub fn bucketing_identifier(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.session_id.as_deref())
            .or(self.tenant_id.as_deref())
            .unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub flag_key: String,
    pub value: FlagValue,
    pub source: EvaluationSource,
    /// Version of the definition that was evaluated, if there was one.
    pub version: Option<i64>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    /// The type-agnostic false/zero result used when nothing is known.
    pub fn fallback(flag_key: &str, source: EvaluationSource, now: DateTime<Utc>) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            value: FlagValue::Boolean(false),
            source,
            version: None,
            evaluated_at: now,
        }
    }
}
