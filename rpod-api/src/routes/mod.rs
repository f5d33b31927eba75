pub mod health;
pub mod sessions;

use crate::state::AppState;
use axum::Router;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Success body: the payload's fields plus `"ok": true`.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    #[serde(flatten)]
    pub body: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(body: T) -> Self {
        Self { ok: true, body }
    }
}

pub fn create_app(state: AppState) -> Router {
    // The login front end is served from a different origin
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(health::routes())
        .merge(sessions::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
