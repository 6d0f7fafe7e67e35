//! Authoritative session map with identity reconciliation.
//!
//! A new conversation is keyed by a `temp-*` placeholder until the agent reveals the
//! durable identity in one of its messages. A resumed conversation may be handed a
//! fresh identity mid-stream. Either way the [`Session`] object is re-keyed in place:
//! the old key is removed and the new key inserted while holding the map's write
//! lock, so a concurrent lookup sees the session under exactly one of the two keys.
//!
//! Lock order is always map, then session. No lock is held across an `.await`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use log::{debug, error, info, warn};
use parley_protocol::{
    ChatOptions, Message, SessionSnapshot, SessionStatus, placeholder_id, restamp,
};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use super::error::{RegistryError, RegistryResult};
use crate::agent::{AgentBackend, AgentError, AgentMessageStream, AgentQuery, McpConfigFile};

/// Messages of one request, already recorded in the registry.
pub type SessionMessageStream = Pin<Box<dyn Stream<Item = RegistryResult<Message>> + Send>>;

/// A started request.
pub struct ChatStream {
    /// Key the session had when the request started.
    pub session_id: String,
    pub messages: SessionMessageStream,
}

type SessionHandle = Arc<Mutex<Session>>;

#[derive(Debug)]
struct Session {
    id: String,
    messages: Vec<Message>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Still keyed by a locally generated identity.
    placeholder: bool,
    /// Identities this session was renamed away from, oldest first.
    aliases: Vec<String>,
    /// Present only while a stream is in flight.
    cancel: Option<CancellationToken>,
    /// Bumped for every stream; lets a finished stream release only its own handle.
    epoch: u64,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            placeholder: true,
            aliases: Vec::new(),
            cancel: None,
            epoch: 0,
        }
    }

    fn in_flight(&self) -> bool {
        self.cancel.is_some()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Attach a new stream and append the user's prompt ahead of the reply.
    fn open_stream(&mut self, prompt: &str, token: &CancellationToken) -> u64 {
        self.epoch += 1;
        self.cancel = Some(token.clone());
        self.status = SessionStatus::Active;
        self.messages
            .push(Message::user_prompt(prompt, self.id.clone()));
        self.touch();
        self.epoch
    }

    fn close_stream(&mut self, epoch: u64) {
        if self.epoch == epoch {
            self.cancel = None;
        }
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Completed;
        }
        self.touch();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            messages: self.messages.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            streaming: self.in_flight(),
        }
    }
}

fn lock(handle: &SessionHandle) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every session for the lifetime of the server.
pub struct SessionRegistry {
    backend: Arc<dyn AgentBackend>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Parent of every stream's cancellation token.
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a request: continue `resume` if it is known, otherwise open a new
    /// conversation under a placeholder identity.
    ///
    /// Input errors are returned before anything is streamed. The agent query is
    /// issued when the returned stream is first polled.
    pub fn begin(
        self: &Arc<Self>,
        prompt: &str,
        resume: Option<&str>,
        options: ChatOptions,
    ) -> RegistryResult<ChatStream> {
        if prompt.trim().is_empty() {
            return Err(RegistryError::InvalidInput("Prompt is required".into()));
        }

        let mcp = match options.mcp_config.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(json) => Some(McpConfigFile::materialize(json)?),
            None => None,
        };

        let token = self.shutdown.child_token();
        let opened = self.open(prompt, resume, &token)?;

        let query = AgentQuery {
            prompt: prompt.to_string(),
            resume: opened.resume,
            mcp_config_path: mcp.as_ref().map(|f| f.path().to_path_buf()),
            options,
        };

        let state = StreamState {
            registry: Arc::clone(self),
            handle: opened.handle,
            token,
            epoch: opened.epoch,
            query: Some(query),
            mcp,
            inner: None,
            finished: false,
        };
        let messages = stream::unfold(state, |mut state| async move {
            let item = state.next().await?;
            Some((item, state))
        });

        Ok(ChatStream {
            session_id: opened.key,
            messages: Box::pin(messages),
        })
    }

    fn open(
        &self,
        prompt: &str,
        resume: Option<&str>,
        token: &CancellationToken,
    ) -> RegistryResult<Opened> {
        let mut sessions = self.write_sessions();

        if let Some(requested) = resume.map(str::trim).filter(|r| !r.is_empty()) {
            if let Some(handle) = find_in(&sessions, requested) {
                let mut session = lock(&handle);
                if session.in_flight() {
                    return Err(RegistryError::StreamInProgress(session.id.clone()));
                }
                let epoch = session.open_stream(prompt, token);
                let key = session.id.clone();
                // A placeholder was never known to the agent.
                let resume = (!session.placeholder).then(|| key.clone());
                info!("resuming session {} (requested as {})", key, requested);
                drop(session);
                return Ok(Opened {
                    handle,
                    key,
                    epoch,
                    resume,
                });
            }
            warn!(
                "resume requested for unknown session {}, starting a new conversation",
                requested
            );
        }

        let key = placeholder_id();
        let mut session = Session::new(key.clone());
        let epoch = session.open_stream(prompt, token);
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(key.clone(), Arc::clone(&handle));
        info!("opened new session under placeholder {}", key);

        Ok(Opened {
            handle,
            key,
            epoch,
            resume: None,
        })
    }

    /// Append one agent message, renaming the session first if the message carries
    /// a new identity.
    fn record(&self, handle: &SessionHandle, mut message: Message) -> Message {
        if let Some(incoming) = message.session_id().map(str::to_owned) {
            let needs_rename = {
                let session = lock(handle);
                session.id != incoming && !session.aliases.contains(&incoming)
            };
            if needs_rename {
                self.rename(handle, &incoming);
            }
        }

        let mut session = lock(handle);
        message.set_session_id(session.id.clone());
        let cancelled = session.cancel.as_ref().is_some_and(|t| t.is_cancelled());
        match &message {
            Message::Error(error) if !cancelled => {
                warn!("agent reported an error for {}: {}", session.id, error.error);
                session.status = SessionStatus::Error;
            }
            Message::Result(_) if session.status == SessionStatus::Active => {
                session.status = SessionStatus::Completed;
            }
            _ => {}
        }
        session.messages.push(message.clone());
        session.touch();
        message
    }

    fn rename(&self, handle: &SessionHandle, new_id: &str) {
        let mut sessions = self.write_sessions();
        let mut session = lock(handle);
        if session.id == new_id {
            return;
        }

        let old_id = std::mem::replace(&mut session.id, new_id.to_string());
        if sessions
            .get(&old_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            sessions.remove(&old_id);
        }
        if let Some(previous) = sessions.insert(new_id.to_string(), Arc::clone(handle)) {
            if !Arc::ptr_eq(&previous, handle) {
                warn!("session {} replaced an existing record with the same id", new_id);
            }
        }

        let restamped = restamp(&mut session.messages, &old_id, new_id);
        session.aliases.push(old_id.clone());
        session.placeholder = false;
        info!(
            "session {} is now {} ({} messages restamped)",
            old_id, new_id, restamped
        );
    }

    /// Ask the in-flight stream of `id` to stop.
    ///
    /// Returns false when there is nothing to abort: the session is unknown, or its
    /// last stream already ended or was already cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(handle) = self.find(id) else {
            debug!("cancel: no session {}", id);
            return false;
        };

        let mut session = lock(&handle);
        match session.cancel.clone() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                session.status = SessionStatus::Completed;
                session.touch();
                info!("cancelled stream for session {}", session.id);
                true
            }
            _ => false,
        }
    }

    /// Look up a session by its current identity or any identity it had before.
    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.find(id).map(|handle| lock(&handle).snapshot())
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.read_sessions();
        let mut snapshots: Vec<SessionSnapshot> =
            sessions.values().map(|h| lock(h).snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions with a stream in flight.
    pub fn active_streams(&self) -> usize {
        self.read_sessions()
            .values()
            .filter(|h| lock(h).in_flight())
            .count()
    }

    /// Drop placeholder sessions that never learned a durable identity, have no
    /// stream in flight, and have been idle for at least `ttl`.
    pub fn reap_orphans(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let mut sessions = self.write_sessions();
        let before = sessions.len();
        sessions.retain(|key, handle| {
            let session = lock(handle);
            let idle = (now - session.updated_at).to_std().unwrap_or_default();
            let orphan = session.placeholder && !session.in_flight() && idle >= ttl;
            if orphan {
                info!(
                    "reaping orphaned placeholder session {} (status {}, idle {:?})",
                    key, session.status, idle
                );
            }
            !orphan
        });
        before - sessions.len()
    }

    /// Cancel every in-flight stream. Returns how many were running.
    pub fn shutdown(&self) -> usize {
        let running = self.active_streams();
        info!("shutting down session registry ({} active streams)", running);
        self.shutdown.cancel();
        running
    }

    fn find(&self, id: &str) -> Option<SessionHandle> {
        find_in(&self.read_sessions(), id)
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_in(sessions: &HashMap<String, SessionHandle>, id: &str) -> Option<SessionHandle> {
    if let Some(handle) = sessions.get(id) {
        return Some(Arc::clone(handle));
    }
    sessions
        .values()
        .find(|h| lock(h).aliases.iter().any(|alias| alias == id))
        .cloned()
}

struct Opened {
    handle: SessionHandle,
    key: String,
    epoch: u64,
    resume: Option<String>,
}

/// Drives one request's agent stream and records what it yields.
///
/// Dropping it before the agent finished (for example because the client hung up)
/// cancels the agent and releases the session's stream slot.
struct StreamState {
    registry: Arc<SessionRegistry>,
    handle: SessionHandle,
    token: CancellationToken,
    epoch: u64,
    query: Option<AgentQuery>,
    mcp: Option<McpConfigFile>,
    inner: Option<AgentMessageStream>,
    finished: bool,
}

impl StreamState {
    async fn next(&mut self) -> Option<RegistryResult<Message>> {
        if self.finished {
            return None;
        }

        if self.inner.is_none() {
            let query = self.query.take()?;
            let backend = Arc::clone(&self.registry.backend);
            debug!("starting {} agent query", backend.name());
            match backend.query(query, self.token.clone()).await {
                Ok(inner) => self.inner = Some(inner),
                Err(e) => return self.fail(e),
            }
        }

        let inner = self.inner.as_mut()?;
        match inner.next().await {
            Some(Ok(message)) => Some(Ok(self.registry.record(&self.handle, message))),
            Some(Err(e)) => self.fail(e),
            None => {
                self.complete();
                None
            }
        }
    }

    fn fail(&mut self, err: AgentError) -> Option<RegistryResult<Message>> {
        self.finished = true;
        self.inner = None;
        self.release_mcp();

        let mut session = lock(&self.handle);
        if self.token.is_cancelled() {
            info!(
                "stream for session {} ended after cancellation: {}",
                session.id, err
            );
            session.close_stream(self.epoch);
            return None;
        }

        let session_id = session.id.clone();
        session
            .messages
            .push(Message::error(err.to_string(), Some(session_id.clone())));
        session.status = SessionStatus::Error;
        session.close_stream(self.epoch);
        drop(session);

        error!("agent stream for session {} failed: {}", session_id, err);
        Some(Err(RegistryError::StreamFailed {
            session_id,
            source: err,
        }))
    }

    fn complete(&mut self) {
        self.finished = true;
        self.inner = None;
        self.release_mcp();

        let mut session = lock(&self.handle);
        session.close_stream(self.epoch);
        debug!(
            "stream for session {} finished with status {}",
            session.id, session.status
        );
    }

    fn release_mcp(&mut self) {
        if let Some(file) = self.mcp.take() {
            file.release();
        }
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        if !self.finished {
            debug!("stream dropped before completion, cancelling agent");
            self.token.cancel();
            self.complete();
        }
    }
}
