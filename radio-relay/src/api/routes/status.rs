//! Public stream status.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::server::AppState;
use crate::fanout::StatusSnapshot;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(current_status))
}

/// The snapshot listeners would receive right now.
async fn current_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.services.fanout.snapshot().await)
}
