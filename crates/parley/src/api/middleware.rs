//! Error diagnostics middleware.

use axum::{
    Json,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use super::error::{ErrorDetails, ErrorResponse};
use super::state::AppState;

/// Log every error response with its method and path. In development, also put the
/// withheld diagnostic detail into the body.
pub async fn error_diagnostics(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    let Some(diag) = response.extensions_mut().remove::<ErrorDetails>() else {
        return response;
    };

    let status = response.status();
    if status.is_server_error() {
        error!(
            %method,
            %path,
            status = status.as_u16(),
            error = %diag.message,
            details = diag.hidden.as_deref().unwrap_or(""),
            "request failed"
        );
    } else {
        warn!(
            %method,
            %path,
            status = status.as_u16(),
            error = %diag.message,
            "request rejected"
        );
    }

    match diag.hidden {
        Some(details) if state.environment.is_development() => {
            let body = ErrorResponse {
                error: diag.message,
                code: diag.code,
                details: Some(details),
            };
            (status, Json(body)).into_response()
        }
        _ => response,
    }
}
