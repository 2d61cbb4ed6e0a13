//! Broadcast inspection and operator control.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::BroadcastId;
use crate::health::HealthReport;
use crate::reconnection::ReconnectionAttempt;
use crate::relay::RelayStatus;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_broadcasts))
        .route("/{broadcast_id}", get(get_broadcast))
        .route("/{broadcast_id}/end", post(end_broadcast))
}

/// Everything the core knows about one broadcast.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastDetails {
    pub broadcast_id: BroadcastId,
    pub relay: Option<RelayStatus>,
    pub health: Option<HealthReport>,
    pub reconnection: Option<ReconnectionAttempt>,
    pub recovery_exhausted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndBroadcastResponse {
    pub broadcast_id: BroadcastId,
    pub ended: bool,
}

async fn list_broadcasts(State(state): State<AppState>) -> Json<Vec<RelayStatus>> {
    Json(state.services.relays.statuses())
}

async fn get_broadcast(
    State(state): State<AppState>,
    Path(broadcast_id): Path<String>,
) -> ApiResult<Json<BroadcastDetails>> {
    let id = BroadcastId::from(broadcast_id);
    let services = &state.services;

    let details = BroadcastDetails {
        relay: services.relays.relay_status(&id),
        health: services.health_monitor.latest(&id),
        reconnection: services.reconnection.attempt(&id),
        recovery_exhausted: services.health_monitor.is_exhausted(&id),
        broadcast_id: id.clone(),
    };

    let known = details.relay.is_some()
        || details.health.is_some()
        || details.reconnection.is_some()
        || details.recovery_exhausted
        || services.health_monitor.is_watching(&id);
    if !known {
        return Err(ApiError::not_found(format!("Broadcast '{}' is not active", id)));
    }

    Ok(Json(details))
}

/// Operator end: stop the relay, stop watching and cancel recovery.
async fn end_broadcast(
    State(state): State<AppState>,
    Path(broadcast_id): Path<String>,
) -> Json<EndBroadcastResponse> {
    let id = BroadcastId::from(broadcast_id);
    let ended = state.services.end_broadcast(&id);
    Json(EndBroadcastResponse {
        broadcast_id: id,
        ended,
    })
}
