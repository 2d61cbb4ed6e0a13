//! API route modules.

pub mod broadcasts;
pub mod health;
pub mod listener;
pub mod live;
pub mod logging;
pub mod reconnection;
pub mod status;

use axum::Router;

use crate::api::server::AppState;

/// The application router with every route mounted.
pub fn create_router(state: AppState) -> Router {
    let sockets = live::router()
        .merge(listener::router())
        .merge(reconnection::router());

    Router::new()
        .nest("/ws", sockets)
        .nest("/api/broadcasts", broadcasts::router())
        .nest("/api/status", status::router())
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .with_state(state)
}
