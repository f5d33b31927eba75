use super::Envelope;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Form, Json, Router,
};
use rpod_orchestrator::{LaunchOutcome, SessionListing, SessionStatus, StopOutcome};
use serde::Deserialize;
use tracing::info;

const DEFAULT_RESOURCE: &str = "rstudio";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/launch", post(launch))
        .route("/stop", post(stop))
        .route("/status/{username}", get(status))
        .route("/sessions", get(list_sessions))
}

#[derive(Debug, Deserialize)]
pub struct LaunchForm {
    pub username: String,
    #[serde(default = "default_resource")]
    pub resource: String,
}

fn default_resource() -> String {
    DEFAULT_RESOURCE.to_string()
}

#[derive(Debug, Deserialize)]
pub struct StopForm {
    pub username: String,
}

async fn launch(
    State(state): State<AppState>,
    Form(form): Form<LaunchForm>,
) -> ApiResult<Json<Envelope<LaunchOutcome>>> {
    let username = form.username.trim();
    info!(username, resource = %form.resource, "launch requested");
    if !form.resource.eq_ignore_ascii_case(DEFAULT_RESOURCE) {
        return Err(ApiError::BadRequest(format!(
            "unsupported resource '{}'",
            form.resource
        )));
    }

    let outcome = state.orchestrator.launch(username).await?;
    Ok(Json(Envelope::ok(outcome)))
}

async fn stop(
    State(state): State<AppState>,
    Form(form): Form<StopForm>,
) -> ApiResult<Json<Envelope<StopOutcome>>> {
    let outcome = state.orchestrator.stop(form.username.trim()).await?;
    Ok(Json(Envelope::ok(outcome)))
}

async fn status(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    Ok(Json(state.orchestrator.status(&username).await?))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionListing>>> {
    Ok(Json(state.orchestrator.list_sessions().await?))
}
