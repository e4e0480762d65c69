use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "expense-import-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready when the datastore answers. A cache outage only degrades.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let cache = match state.cache.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Cache health check failed");
            "degraded".to_string()
        }
    };

    match state.imports.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "datastore": "ok", "cache": cache })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Datastore health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "datastore": "down", "cache": cache })),
            )
        }
    }
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
