//! Narration client error types.

use thiserror::Error;

/// Result type for narration operations.
pub type NarrationResult<T> = Result<T, NarrationError>;

/// Errors that can occur while talking to the narration service.
#[derive(Debug, Error)]
pub enum NarrationError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("narration service returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        /// Raw response body, relayed as diagnostic detail.
        body: String,
    },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// A generation response carried neither inline audio nor an audio URL.
    #[error("narration response contained no audio")]
    MissingAudio,

    #[error("invalid base64 audio: {0}")]
    Decode(#[from] base64::DecodeError),
}
