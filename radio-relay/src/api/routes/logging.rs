//! Runtime log filter control.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/filter", get(get_filter).put(update_filter))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilter {
    pub filter: String,
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilter>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging control not available"))?;
    Ok(Json(LogFilter {
        filter: config.current_filter(),
    }))
}

async fn update_filter(
    State(state): State<AppState>,
    Json(request): Json<LogFilter>,
) -> ApiResult<Json<LogFilter>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging control not available"))?;
    config.set_filter(&request.filter)?;
    Ok(Json(LogFilter {
        filter: config.current_filter(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_request_deserialize() {
        let request: LogFilter = serde_json::from_str(r#"{"filter":"radio_relay=debug"}"#).unwrap();
        assert_eq!(request.filter, "radio_relay=debug");
    }
}
