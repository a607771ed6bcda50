use chrono::{DateTime, Utc};

use crate::flags::{
    evaluation_source::EvaluationSource,
    flag_hashing::bucket,
    flag_models::{
        EvaluationContext, EvaluationResult, FlagDefinition, FlagKind, FlagOverride, FlagSnapshot,
        FlagValue, FlagVariant, OverrideTarget,
    },
};

/// Resolve a flag for a request context.
///
/// Pure: everything it needs is passed in, and it never fails. The rules are
/// tried in order and the first one that applies decides the value:
///
/// 1. unknown flag -> `false` (default)
/// 2. archived or disabled -> flag default (disabled)
/// 3. outside the schedule window -> flag default (schedule)
/// 4. live user override (override)
/// 5. live tenant override (override)
/// 6. tenant in `disabled_tenants` -> `false` (targeting)
/// 7. `enabled_tenants` non-empty -> membership (targeting)
/// 8. user in `enabled_users` -> `true` (targeting), otherwise fall through
/// 9. percentage flags -> `bucket < percentage` (rollout)
/// 10. variant flags -> weighted variant (rollout)
/// 11. flag default (default)
pub fn evaluate(
    snapshot: Option<&FlagSnapshot>,
    flag_key: &str,
    context: &EvaluationContext,
    now: DateTime<Utc>,
) -> EvaluationResult {
    let Some(snapshot) = snapshot else {
        return EvaluationResult::fallback(flag_key, EvaluationSource::Default, now);
    };
    let flag = &snapshot.definition;
    let (value, source) = resolve(flag, &snapshot.overrides, context, now);

    EvaluationResult {
        flag_key: flag.key.clone(),
        value,
        source,
        version: Some(flag.version),
        evaluated_at: now,
    }
}

fn resolve(
    flag: &FlagDefinition,
    overrides: &[FlagOverride],
    context: &EvaluationContext,
    now: DateTime<Utc>,
) -> (FlagValue, EvaluationSource) {
    if flag.is_archived || !flag.is_enabled {
        return (flag.default_value(), EvaluationSource::Disabled);
    }

    if !within_schedule(flag, now) {
        return (flag.default_value(), EvaluationSource::Schedule);
    }

    if let Some(user_id) = context.user_id.as_deref() {
        if let Some(ov) = live_override(overrides, now, |t| t.user_id() == Some(user_id)) {
            return (ov.value.clone(), EvaluationSource::Override);
        }
    }

    if let Some(tenant_id) = context.tenant_id.as_deref() {
        if let Some(ov) = live_override(overrides, now, |t| t.tenant_id() == Some(tenant_id)) {
            return (ov.value.clone(), EvaluationSource::Override);
        }

        if flag.disabled_tenants.contains(tenant_id) {
            return (FlagValue::Boolean(false), EvaluationSource::Targeting);
        }
    }

    // A configured tenant allow-list is exhaustive
    if !flag.enabled_tenants.is_empty() {
        let member = context
            .tenant_id
            .as_deref()
            .is_some_and(|tenant_id| flag.enabled_tenants.contains(tenant_id));
        return (FlagValue::Boolean(member), EvaluationSource::Targeting);
    }

    // The user allow-list only grants; non-members fall through to rollout
    if context
        .user_id
        .as_deref()
        .is_some_and(|user_id| flag.enabled_users.contains(user_id))
    {
        return (FlagValue::Boolean(true), EvaluationSource::Targeting);
    }

    match &flag.kind {
        FlagKind::Percentage { percentage, .. } => {
            let b = bucket(&flag.salt, &flag.key, context.bucketing_identifier());
            (
                FlagValue::Boolean(b < *percentage),
                EvaluationSource::Rollout,
            )
        }
        FlagKind::Variant { variants, .. } if !variants.is_empty() => {
            let b = bucket(&flag.salt, &flag.key, context.bucketing_identifier());
            (
                FlagValue::String(select_variant(variants, b).key.clone()),
                EvaluationSource::Rollout,
            )
        }
        _ => (flag.default_value(), EvaluationSource::Default),
    }
}

fn within_schedule(flag: &FlagDefinition, now: DateTime<Utc>) -> bool {
    let started = flag.schedule_start.map_or(true, |start| now >= start);
    let not_ended = flag.schedule_end.map_or(true, |end| now <= end);
    started && not_ended
}

fn live_override<F>(
    overrides: &[FlagOverride],
    now: DateTime<Utc>,
    target: F,
) -> Option<&FlagOverride>
where
    F: Fn(&OverrideTarget) -> bool,
{
    overrides
        .iter()
        .find(|ov| target(&ov.target) && !ov.is_expired(now))
}

/// First variant whose cumulative weight, scaled to 100, exceeds the bucket.
/// With weights summing to 100 this is the plain cumulative-percentage rule.
/// Callers guarantee `variants` is non-empty.
fn select_variant(variants: &[FlagVariant], bucket: u8) -> &FlagVariant {
    let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
    if total == 0 {
        return &variants[0];
    }

    let mut cumulative = 0u64;
    for variant in variants {
        cumulative += u64::from(variant.weight);
        if u64::from(bucket) * total < cumulative * 100 {
            return variant;
        }
    }
    &variants[0]
}
