//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;

use crate::api::server::AppState;
use crate::resilience::CircuitState;
use crate::services::ServiceStats;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub stats: ServiceStats,
}

/// Degraded when upstream probes are being refused or the transcoder is
/// unavailable. Never touches upstream itself.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.services.stats().await;
    let degraded = stats.circuit.state != CircuitState::Closed || !stats.transcoder_available;

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        stats,
    })
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptimeSecs": state.start_time.elapsed().as_secs(),
        })),
    )
}
