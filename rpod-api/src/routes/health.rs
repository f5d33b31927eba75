use crate::{error::ApiResult, state::AppState};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/users", get(list_users))
        .route("/ports", get(list_ports))
        .route("/nodeports", get(list_ports))
}

async fn service_info(State(state): State<AppState>) -> Json<Value> {
    let info = &state.info;
    Json(json!({
        "service": "rpod-api",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": info.backend,
        "config": info.users_file,
        "port_range": info.port_range.to_string(),
        "max_session_hours": info.max_session_hours,
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "rpod-api",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.orchestrator.backend().name(),
        "config_exists": state.info.users_file.is_file(),
        "max_session_hours": state.info.max_session_hours,
    }))
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let users = state.orchestrator.usernames().await?;
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

async fn list_ports(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let usage = state.orchestrator.ports().usage().await?;
    Ok(Json(json!({
        "used_ports": usage.used_ports,
        "available_range": usage.range.to_string(),
        "used_count": usage.used_ports.len(),
        "available_count": usage.available,
    })))
}
