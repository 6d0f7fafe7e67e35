//! HTTP API module.
//!
//! Streams agent conversations to clients and passes narration requests through to
//! the voice service.

mod error;
mod handlers;
mod middleware;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorDetails, ErrorResponse};
pub use handlers::{CwdResponse, HealthResponse, MessageResponse};
pub use routes::create_router;
pub use state::AppState;
