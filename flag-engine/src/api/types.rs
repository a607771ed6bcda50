use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::flags::flag_models::{EvaluationContext, EvaluationResult, FlagPatch};

pub const DEFAULT_AUDIT_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluateRequest {
    pub key: String,
    #[serde(default)]
    pub context: EvaluationContext,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EvaluateAllRequest {
    #[serde(default)]
    pub context: EvaluationContext,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EvaluateAllResponse {
    pub flags: HashMap<String, EvaluationResult>,
}

/// `PATCH /admin/flags/:key` body: the patch fields inline, plus the
/// version the caller last read.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateFlagRequest {
    pub expected_version: i64,
    #[serde(flatten)]
    pub patch: FlagPatch,
}

/// Kill switch, rollout abort and guardrail trips all carry just a reason.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartRolloutRequest {
    pub steps: Vec<u8>,
    pub step_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuditQueryParams {
    pub limit: Option<usize>,
}

impl AuditQueryParams {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_AUDIT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_request_flattens_patch() {
        let request: UpdateFlagRequest = serde_json::from_value(json!({
            "expected_version": 3,
            "percentage": 40,
            "is_enabled": true,
        }))
        .unwrap();

        assert_eq!(request.expected_version, 3);
        assert_eq!(request.patch.percentage, Some(40));
        assert_eq!(request.patch.is_enabled, Some(true));
        assert!(request.patch.name.is_none());
    }

    #[test]
    fn test_evaluate_request_context_is_optional() {
        let request: EvaluateRequest = serde_json::from_value(json!({"key": "checkout"})).unwrap();
        assert_eq!(request.context, EvaluationContext::default());
    }

    #[test]
    fn test_audit_limit_default() {
        assert_eq!(AuditQueryParams::default().limit(), DEFAULT_AUDIT_LIMIT);
        assert_eq!(AuditQueryParams { limit: Some(5) }.limit(), 5);
    }
}
