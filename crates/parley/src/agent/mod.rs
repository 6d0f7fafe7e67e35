//! Agent backend boundary.
//!
//! The coding agent is a black-box source of [`Message`]s. [`AgentBackend`] abstracts
//! how a query reaches it:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               SessionRegistry                │
//! │   "run this prompt, resume that session"     │
//! └──────────────────────┬───────────────────────┘
//!                        │ AgentQuery + CancellationToken
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  CliAgentBackend  │     │  ScriptedBackend  │
//! │ spawns the agent  │     │ replays canned    │
//! │ CLI, stream-json  │     │ message scripts   │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! Cancellation is cooperative: the token asks the backend to stop, and anything the
//! backend still yields afterwards is delivered normally.

mod cli;
mod mcp;
mod scripted;

pub use cli::{CliAgentBackend, CliAgentConfig};
pub use mcp::{McpConfigError, McpConfigFile};
pub use scripted::{RecordedQuery, ScriptStep, ScriptedBackend};

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use parley_protocol::{ChatOptions, Message};
use thiserror::Error;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Messages produced by one query, in emission order.
pub type AgentMessageStream = Pin<Box<dyn Stream<Item = AgentResult<Message>> + Send>>;

/// Errors raised while starting or consuming an agent query.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent executable could not be started.
    #[error("failed to start agent '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading from or writing to the agent failed.
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent exited unsuccessfully before producing a result.
    #[error("agent exited with {}: {stderr}", exit_label(.code))]
    Exited { code: Option<i32>, stderr: String },

    /// The agent reported a failure.
    #[error("agent failed: {0}")]
    Failed(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// One prompt for the agent.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub prompt: String,
    /// Durable identity of the conversation to continue.
    pub resume: Option<String>,
    pub options: ChatOptions,
    /// Materialized MCP configuration for this query only.
    pub mcp_config_path: Option<PathBuf>,
}

/// The unified interface for running agent queries.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start a query. The returned stream ends when the agent finishes, or soon after
    /// `cancel` fires.
    async fn query(
        &self,
        query: AgentQuery,
        cancel: CancellationToken,
    ) -> AgentResult<AgentMessageStream>;
}
