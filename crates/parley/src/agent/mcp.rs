//! Ephemeral MCP server configuration for a single query.

use std::io::Write;
use std::path::Path;

use log::{debug, warn};
use serde_json::Value;
use tempfile::TempPath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpConfigError {
    #[error("invalid MCP configuration: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid MCP configuration: expected a JSON object")]
    NotAnObject,

    #[error("failed to write MCP configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// A `parley-mcp-*.json` file that lives exactly as long as this guard.
///
/// Dropping the guard deletes the file, so every exit path of the owning stream
/// (completion, error, cancellation, or a client hanging up) cleans up.
#[derive(Debug)]
pub struct McpConfigFile {
    path: TempPath,
}

impl McpConfigFile {
    /// Validate `json` and write it to the system temp directory.
    pub fn materialize(json: &str) -> Result<Self, McpConfigError> {
        Self::materialize_in(&std::env::temp_dir(), json)
    }

    pub fn materialize_in(dir: &Path, json: &str) -> Result<Self, McpConfigError> {
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(McpConfigError::NotAnObject);
        }

        let mut file = tempfile::Builder::new()
            .prefix("parley-mcp-")
            .suffix(".json")
            .tempfile_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &value)?;
        file.flush()?;

        let path = file.into_temp_path();
        debug!("materialized MCP config at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now, reporting failures instead of ignoring them.
    pub fn release(self) {
        let display = self.path.display().to_string();
        if let Err(e) = self.path.close() {
            warn!("failed to remove MCP config {}: {}", display, e);
        } else {
            debug!("removed MCP config {}", display);
        }
    }
}
