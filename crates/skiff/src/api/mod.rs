//! HTTP API module.
//!
//! Health and session status endpoints plus the browser WebSocket route.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
