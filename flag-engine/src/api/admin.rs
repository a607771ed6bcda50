//! Administrative HTTP handlers. Mutations need an `x-actor` header; the
//! rest of the actor context is taken from the request when present.

use std::net::SocketAddr;

use axum::extract::{
    rejection::{JsonRejection, QueryRejection},
    ConnectInfo, FromRequestParts, Path, Query, State,
};
use axum::http::{request::Parts, HeaderMap, StatusCode};
use axum::{async_trait, Json};
use tracing::warn;
use uuid::Uuid;

use crate::{
    api::{
        errors::FlagError,
        types::{AuditQueryParams, ReasonRequest, StartRolloutRequest, UpdateFlagRequest},
    },
    audit::{ActorContext, AuditRecord},
    flags::flag_models::{FlagDefinition, FlagOverride, NewFlag, NewOverride},
    rollout::RolloutPlan,
    router,
};

pub const ACTOR_HEADER: &str = "x-actor";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Who is making an administrative call.
pub struct Actor(pub ActorContext);

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = FlagError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = header_value(&parts.headers, ACTOR_HEADER).ok_or_else(|| {
            FlagError::Validation(format!("the {ACTOR_HEADER} header is required"))
        })?;

        // first hop of x-forwarded-for, then the peer
        let ip = header_value(&parts.headers, FORWARDED_FOR_HEADER)
            .and_then(|forwarded| {
                forwarded
                    .split(',')
                    .next()
                    .map(|ip| ip.trim().to_string())
            })
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            });

        Ok(Actor(ActorContext {
            actor,
            tenant_id: header_value(&parts.headers, TENANT_HEADER),
            ip,
            user_agent: header_value(&parts.headers, axum::http::header::USER_AGENT.as_str()),
        }))
    }
}

pub async fn create_flag(
    state: State<router::State>,
    Actor(actor): Actor,
    payload: Result<Json<NewFlag>, JsonRejection>,
) -> Result<(StatusCode, Json<FlagDefinition>), FlagError> {
    let Json(new_flag) = payload?;
    let flag = state.registry.admin().create_flag(new_flag, &actor).await?;
    Ok((StatusCode::CREATED, Json(flag)))
}

pub async fn get_flag(
    state: State<router::State>,
    Path(flag_key): Path<String>,
) -> Result<Json<FlagDefinition>, FlagError> {
    Ok(Json(state.registry.admin().get_flag(&flag_key).await?))
}

pub async fn update_flag(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    Actor(actor): Actor,
    payload: Result<Json<UpdateFlagRequest>, JsonRejection>,
) -> Result<Json<FlagDefinition>, FlagError> {
    let Json(request) = payload?;
    let flag = state
        .registry
        .admin()
        .update_flag(&flag_key, &request.patch, request.expected_version, &actor)
        .await?;
    Ok(Json(flag))
}

pub async fn add_override(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    Actor(actor): Actor,
    payload: Result<Json<NewOverride>, JsonRejection>,
) -> Result<(StatusCode, Json<FlagOverride>), FlagError> {
    let Json(new_override) = payload?;
    let flag_override = state
        .registry
        .admin()
        .add_override(&flag_key, new_override, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(flag_override)))
}

pub async fn remove_override(
    state: State<router::State>,
    Path(id): Path<String>,
    Actor(actor): Actor,
) -> Result<StatusCode, FlagError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| FlagError::Validation(format!("invalid override id {id:?}")))?;
    state.registry.admin().remove_override(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn kill_switch(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    Actor(actor): Actor,
    payload: Result<Json<ReasonRequest>, JsonRejection>,
) -> Result<Json<FlagDefinition>, FlagError> {
    let Json(request) = payload?;
    let flag = state
        .registry
        .admin()
        .kill_switch(&flag_key, &request.reason, &actor)
        .await?;
    Ok(Json(flag))
}

pub async fn list_audit(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    query: Result<Query<AuditQueryParams>, QueryRejection>,
) -> Result<Json<Vec<AuditRecord>>, FlagError> {
    let Query(params) = query?;
    let records = state
        .registry
        .admin()
        .list_audit(&flag_key, params.limit())
        .await?;
    Ok(Json(records))
}

pub async fn start_rollout(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    Actor(actor): Actor,
    payload: Result<Json<StartRolloutRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RolloutPlan>), FlagError> {
    let Json(request) = payload?;
    let plan = state
        .registry
        .rollouts()
        .start_rollout(&flag_key, request.steps, request.step_interval_secs, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn get_rollout(
    state: State<router::State>,
    Path(flag_key): Path<String>,
) -> Result<Json<RolloutPlan>, FlagError> {
    Ok(Json(state.registry.rollouts().get_plan(&flag_key).await?))
}

pub async fn abort_rollout(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    Actor(actor): Actor,
    payload: Result<Json<ReasonRequest>, JsonRejection>,
) -> Result<Json<RolloutPlan>, FlagError> {
    let Json(request) = payload?;
    let plan = state
        .registry
        .rollouts()
        .abort(&flag_key, &request.reason, &actor)
        .await?;
    Ok(Json(plan))
}

/// Raise the guardrail signal for a flag. The rollout controller aborts the
/// flag's staged rollout on its next tick.
pub async fn trip_guardrail(
    state: State<router::State>,
    Path(flag_key): Path<String>,
    Actor(actor): Actor,
    payload: Result<Json<ReasonRequest>, JsonRejection>,
) -> Result<StatusCode, FlagError> {
    let Json(request) = payload?;
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(FlagError::Validation(
            "a guardrail trip requires a reason".to_string(),
        ));
    }
    state.registry.admin().get_flag(&flag_key).await?;

    state.registry.guardrails().trip(&flag_key, reason).await?;
    warn!(flag_key = %flag_key, actor = %actor.actor, reason = %reason, "guardrail tripped");
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Actor, FlagError> {
        let (mut parts, _) = request.into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_actor_context_from_headers() {
        let request = Request::builder()
            .header(ACTOR_HEADER, "alice@example.com")
            .header(TENANT_HEADER, "tenant-1")
            .header(FORWARDED_FOR_HEADER, "10.0.0.1, 10.0.0.2")
            .header("user-agent", "flag-admin/1.0")
            .body(())
            .unwrap();

        let Actor(actor) = extract(request).await.unwrap();
        assert_eq!(actor.actor, "alice@example.com");
        assert_eq!(actor.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(actor.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(actor.user_agent.as_deref(), Some("flag-admin/1.0"));
    }

    #[tokio::test]
    async fn test_peer_address_is_used_without_forwarded_for() {
        let mut request = Request::builder()
            .header(ACTOR_HEADER, "alice")
            .body(())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 7], 4242))));

        let Actor(actor) = extract(request).await.unwrap();
        assert_eq!(actor.ip.as_deref(), Some("192.168.1.7"));
        assert_eq!(actor.tenant_id, None);
    }

    #[tokio::test]
    async fn test_actor_header_is_required() {
        let request = Request::builder()
            .header(ACTOR_HEADER, "  ")
            .body(())
            .unwrap();
        assert!(matches!(
            extract(request).await,
            Err(FlagError::Validation(_))
        ));
    }
}
