use std::{future::ready, sync::Arc};

use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::{
    api::{admin, endpoint},
    config::Config,
    metrics::utils::{setup_metrics_recorder, track_metrics},
    registry::Registry,
};

#[derive(Clone)]
pub struct State {
    pub registry: Arc<Registry>,
}

pub fn router(registry: Arc<Registry>, config: &Config) -> Router {
    let readiness_registry = registry.clone();
    let state = State { registry };

    // liveness/readiness checks
    let status_router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || readiness(readiness_registry.clone())),
        )
        .route("/_liveness", get(|| ready("ok")));

    let flags_router = Router::new()
        .route("/flags/evaluate", post(endpoint::evaluate))
        .route("/flags/evaluate_all", post(endpoint::evaluate_all));

    let admin_router = Router::new()
        .route("/admin/flags", post(admin::create_flag))
        .route(
            "/admin/flags/:key",
            get(admin::get_flag).patch(admin::update_flag),
        )
        .route("/admin/flags/:key/overrides", post(admin::add_override))
        .route("/admin/overrides/:id", delete(admin::remove_override))
        .route("/admin/flags/:key/kill_switch", post(admin::kill_switch))
        .route("/admin/flags/:key/audit", get(admin::list_audit))
        .route(
            "/admin/flags/:key/rollout",
            get(admin::get_rollout).post(admin::start_rollout),
        )
        .route(
            "/admin/flags/:key/rollout/abort",
            post(admin::abort_rollout),
        )
        .route("/admin/flags/:key/guardrail", post(admin::trip_guardrail));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .merge(admin_router)
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Global metrics recorders can play poorly with e.g. tests
    if config.enable_metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

pub async fn readiness(registry: Arc<Registry>) -> Result<&'static str, (StatusCode, String)> {
    registry.ping().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("flag store unavailable: {e}"),
        )
    })?;
    Ok("ready")
}

pub async fn index() -> &'static str {
    "flag engine"
}
