use axum::extract::{rejection::JsonRejection, State};
use axum::{debug_handler, Json};
use tracing::debug;

use crate::{
    api::{
        errors::FlagError,
        types::{EvaluateAllRequest, EvaluateAllResponse, EvaluateRequest},
    },
    flags::flag_models::EvaluationResult,
    router,
};

/// Single flag evaluation. Only a malformed body is an error; everything
/// that goes wrong past that point degrades to a default value.
#[debug_handler]
pub async fn evaluate(
    state: State<router::State>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Result<Json<EvaluationResult>, FlagError> {
    let Json(request) = payload?;
    let result = state
        .registry
        .evaluate(&request.key, &request.context)
        .await;
    debug!(flag_key = %request.key, source = %result.source, "flag evaluated");
    Ok(Json(result))
}

/// Every non-archived flag for one context, for session bootstrap.
#[debug_handler]
pub async fn evaluate_all(
    state: State<router::State>,
    payload: Result<Json<EvaluateAllRequest>, JsonRejection>,
) -> Result<Json<EvaluateAllResponse>, FlagError> {
    let Json(request) = payload?;
    let flags = state.registry.evaluate_all(&request.context).await;
    Ok(Json(EvaluateAllResponse { flags }))
}
