//! Session registry error types.

use thiserror::Error;

use crate::agent::{AgentError, McpConfigError};

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Rejected before any streaming begins.
    #[error("{0}")]
    InvalidInput(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    /// The session already has a stream in flight.
    #[error("Session {0} already has an active stream")]
    StreamInProgress(String),

    #[error(transparent)]
    McpConfig(#[from] McpConfigError),

    /// The agent failed while the stream for `session_id` was being consumed.
    #[error("{source}")]
    StreamFailed {
        session_id: String,
        #[source]
        source: AgentError,
    },
}

impl RegistryError {
    /// Identity of the session the error belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            RegistryError::StreamFailed { session_id, .. } => Some(session_id),
            RegistryError::NotFound(id) | RegistryError::StreamInProgress(id) => Some(id),
            RegistryError::InvalidInput(_) | RegistryError::McpConfig(_) => None,
        }
    }
}
