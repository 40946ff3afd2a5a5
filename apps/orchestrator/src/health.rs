//! Health and metrics HTTP endpoints.
//!
//! - Liveness: `/health`, `/healthz`
//! - Readiness: `/ready`, `/readyz` (checks Redis when configured)
//! - Prometheus: `/metrics`

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use redis::aio::ConnectionManager;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub redis: Option<ConnectionManager>,
    pub app_name: &'static str,
    pub app_version: &'static str,
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

async fn ready_handler(
    State(state): State<Arc<HealthState>>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let Some(redis) = &state.redis else {
        return Ok((
            StatusCode::OK,
            Json(json!({"status": "ready", "checks": {"redis": "not_configured"}})),
        ));
    };
    let mut conn = redis.clone();
    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
    match result {
        Ok(reply) if reply == "PONG" => Ok((
            StatusCode::OK,
            Json(json!({"status": "ready", "checks": {"redis": "ok"}})),
        )),
        Ok(reply) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {"redis": format!("unexpected response: {reply}")},
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {"redis": format!("error: {e}")},
            })),
        )),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match observability::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder not installed".to_string(),
        ),
    }
}
