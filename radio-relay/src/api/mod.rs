//! HTTP and WebSocket surface.

pub mod auth;
pub mod error;
pub mod routes;
pub mod server;

pub use auth::{JwtConfig, JwtService};
pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState};
