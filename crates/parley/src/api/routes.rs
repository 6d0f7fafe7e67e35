//! API route definitions.

use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::middleware::error_diagnostics;
use super::state::AppState;
use crate::narration::NARRATION_KEY_HEADER;

/// Local frontend dev servers allowed when no origins are configured.
const DEV_ORIGINS: [&str; 4] = [
    "http://localhost:5173",
    "http://localhost:5174",
    "http://localhost:5175",
    "http://localhost:5180",
];

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        .route("/chat/start", post(handlers::start_chat))
        .route("/chat/continue", post(handlers::continue_chat))
        .route("/chat/sessions", get(handlers::list_sessions))
        .route("/chat/sessions/{session_id}", get(handlers::get_session))
        .route(
            "/chat/sessions/{session_id}/abort",
            delete(handlers::abort_session),
        )
        .route("/chat/cwd", get(handlers::get_cwd))
        .route("/narration/actors", get(handlers::list_actors))
        .route("/narration/generate", post(handlers::generate_narration));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            error_diagnostics,
        ))
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer based on configuration.
///
/// In development with no configured origins, allows the local frontend dev servers.
/// In production, requires explicit origin configuration.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        HeaderName::from_static(NARRATION_KEY_HEADER),
    ];

    let dev_mode = state.environment.is_development();
    let configured: Vec<&str> = state.cors_origins.iter().map(String::as_str).collect();
    let candidates: Vec<&str> = if configured.is_empty() && dev_mode {
        tracing::warn!("CORS: No origins configured, using local dev origins");
        DEV_ORIGINS.to_vec()
    } else {
        configured
    };

    let origins: Vec<HeaderValue> = candidates
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::warn!("CORS: No usable origins, denying all cross-origin requests");
        return CorsLayer::new().allow_origin(AllowOrigin::exact(
            HeaderValue::from_static("null"), // This effectively denies all CORS
        ));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}
