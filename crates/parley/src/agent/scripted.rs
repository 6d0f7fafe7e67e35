//! Deterministic backend that replays queued scripts.
//!
//! Used by the test suites and handy for exercising clients without an agent
//! installed. Each `query` consumes the next script in FIFO order.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parley_protocol::Message;
use tokio_util::sync::CancellationToken;

use super::{AgentBackend, AgentError, AgentMessageStream, AgentQuery, AgentResult};

/// One step of a scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield this message.
    Emit(Message),
    /// Fail the stream with this error text.
    Fail(String),
    /// Pause; a cancellation during the pause ends the stream.
    Delay(Duration),
    /// Block until the query is cancelled, then end the stream.
    AwaitCancel,
}

/// A query as the scripted backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub query: AgentQuery,
    /// Contents of the MCP config file at the time of the query.
    pub mcp_config: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    queries: Mutex<Vec<RecordedQuery>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the reply for the next query.
    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(steps);
    }

    /// Every query received so far.
    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn query(
        &self,
        query: AgentQuery,
        cancel: CancellationToken,
    ) -> AgentResult<AgentMessageStream> {
        let mcp_config = query
            .mcp_config_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok());
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedQuery { query, mcp_config });

        let steps = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| AgentError::Failed("no scripted reply queued".into()))?;

        let state = (VecDeque::from(steps), cancel);
        Ok(Box::pin(stream::unfold(state, |(mut steps, cancel)| async move {
            loop {
                match steps.pop_front()? {
                    ScriptStep::Emit(message) => return Some((Ok(message), (steps, cancel))),
                    ScriptStep::Fail(error) => {
                        steps.clear();
                        return Some((Err(AgentError::Failed(error)), (steps, cancel)));
                    }
                    ScriptStep::Delay(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = cancel.cancelled() => return None,
                        }
                    }
                    ScriptStep::AwaitCancel => {
                        cancel.cancelled().await;
                        return None;
                    }
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_replays_scripts_in_order() {
        let backend = ScriptedBackend::new();
        backend.push_script(vec![ScriptStep::Emit(Message::error("one", None))]);
        backend.push_script(vec![ScriptStep::Fail("boom".into())]);

        let first: Vec<_> = backend
            .query(AgentQuery::default(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(first.len(), 1);

        let second: Vec<_> = backend
            .query(AgentQuery::default(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(second.as_slice(), [Err(AgentError::Failed(e))] if e == "boom"));

        assert!(
            backend
                .query(AgentQuery::default(), CancellationToken::new())
                .await
                .is_err()
        );
        assert_eq!(backend.queries().len(), 3);
    }

    #[tokio::test]
    async fn test_await_cancel_ends_on_cancel() {
        let backend = ScriptedBackend::new();
        backend.push_script(vec![
            ScriptStep::AwaitCancel,
            ScriptStep::Emit(Message::error("never", None)),
        ]);
        let cancel = CancellationToken::new();
        let mut stream = backend
            .query(AgentQuery::default(), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
