//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::{AppConfig, RunEnvironment};
use crate::narration::NarrationClient;
use crate::session::SessionRegistry;

/// Cloned into every handler. Everything process-wide lives here rather than in
/// statics, so tests build as many independent servers as they like.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Pass-through client for the voice service.
    pub narration: NarrationClient,
    pub environment: RunEnvironment,
    /// Allowed CORS origins; empty means the local development defaults.
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        narration: NarrationClient,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            narration,
            environment: config.server.environment,
            cors_origins: config.server.cors_origins.clone(),
        }
    }
}
