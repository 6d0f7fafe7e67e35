//! Local mirror of the server's sessions.
//!
//! The store shows the user's prompt the moment it is submitted, under a local
//! placeholder identity, and renames the record when the stream reveals the durable
//! one. It performs no I/O: the chat loop feeds it submissions and frames and
//! renders what it holds.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parley_protocol::{
    Frame, Message, SessionSnapshot, SessionStatus, placeholder_id, restamp,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} is still streaming")]
    Busy(String),

    #[error("unknown session {0}")]
    UnknownSession(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalSession {
    pub id: String,
    pub messages: Vec<Message>,
    pub status: SessionStatus,
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Identities this session was renamed away from.
    pub aliases: Vec<String>,
    /// Still keyed by the local placeholder.
    pub placeholder: bool,
    pub last_error: Option<String>,
}

impl LocalSession {
    fn new(id: String, placeholder: bool) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            status: SessionStatus::Active,
            streaming: false,
            created_at: now,
            updated_at: now,
            aliases: Vec::new(),
            placeholder,
            last_error: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// What to send after a submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Local key the prompt was appended under.
    pub local_id: String,
    /// Durable identity to continue, `None` to start a new conversation.
    pub resume: Option<String>,
}

/// Result of applying one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Key of the session after the frame was applied.
    pub id: String,
    /// The message as stored, for frames that carried one.
    pub message: Option<Message>,
    /// The terminal frame arrived.
    pub done: bool,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, LocalSession>,
    selected: Option<String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `prompt` to the selected session, or to a fresh placeholder session when
    /// nothing durable is selected. The target becomes selected and streaming.
    pub fn submit(&mut self, prompt: &str) -> StoreResult<Submission> {
        if let Some(session) = self.selected.as_deref().and_then(|id| self.sessions.get(id)) {
            if session.streaming {
                return Err(StoreError::Busy(session.id.clone()));
            }
        }

        let selected = self
            .selected
            .clone()
            .filter(|id| self.sessions.get(id).is_some_and(|s| !s.placeholder));

        let (key, resume) = match selected {
            Some(id) => (id.clone(), Some(id)),
            None => {
                let id = placeholder_id();
                self.sessions
                    .insert(id.clone(), LocalSession::new(id.clone(), true));
                (id, None)
            }
        };

        let session = self
            .sessions
            .get_mut(&key)
            .ok_or_else(|| StoreError::UnknownSession(key.clone()))?;
        session.messages.push(Message::user_prompt(prompt, key.clone()));
        session.status = SessionStatus::Active;
        session.streaming = true;
        session.last_error = None;
        session.touch();
        self.selected = Some(key.clone());

        Ok(Submission {
            local_id: key,
            resume,
        })
    }

    /// Deselect, so the next submit opens a new conversation.
    pub fn new_conversation(&mut self) {
        self.selected = None;
    }

    /// Apply a frame received for the stream that started under `id`.
    ///
    /// The first message carrying a different identity renames the session; a frame
    /// quoting an identity the session was already renamed away from does not.
    pub fn apply(&mut self, id: &str, frame: Frame) -> StoreResult<ApplyOutcome> {
        let mut key = self.resolve(id)?;

        let mut message = match frame {
            Frame::Done => {
                self.finish(&key);
                return Ok(ApplyOutcome {
                    id: key,
                    message: None,
                    done: true,
                });
            }
            Frame::Message(message) => message,
        };

        if let Some(incoming) = message.session_id().map(str::to_owned) {
            let known = self
                .sessions
                .get(&key)
                .is_some_and(|s| s.id == incoming || s.aliases.contains(&incoming));
            if !known {
                self.rename(&key, &incoming);
                key = incoming;
            }
        }

        let session = self
            .sessions
            .get_mut(&key)
            .ok_or_else(|| StoreError::UnknownSession(key.clone()))?;
        message.set_session_id(key.clone());
        match &message {
            Message::Error(e) => {
                session.status = SessionStatus::Error;
                session.last_error = Some(e.error.clone());
            }
            Message::Result(_) => session.status = SessionStatus::Completed,
            _ => {}
        }
        session.messages.push(message.clone());
        session.touch();

        Ok(ApplyOutcome {
            id: key,
            message: Some(message),
            done: false,
        })
    }

    /// Re-key `from` as `to`, restamping its messages. Selection follows the rename.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return false;
        }
        let Some(mut session) = self.sessions.remove(from) else {
            return false;
        };

        let restamped = restamp(&mut session.messages, from, to);
        session.aliases.push(from.to_string());
        session.id = to.to_string();
        session.placeholder = false;
        session.touch();
        if self.sessions.insert(to.to_string(), session).is_some() {
            warn!("local session {} replaced an existing record", to);
        }

        if self.selected.as_deref() == Some(from) {
            self.selected = Some(to.to_string());
        }
        info!("session {} is now {} ({} messages restamped)", from, to, restamped);
        true
    }

    /// Record a transport failure. Messages already received stay.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) {
        let Some(session) = self.get_mut(id) else {
            return;
        };
        session.status = SessionStatus::Error;
        session.streaming = false;
        session.last_error = Some(error.into());
        session.touch();
    }

    /// The stream ended without error.
    pub fn finish(&mut self, id: &str) {
        let Some(session) = self.get_mut(id) else {
            return;
        };
        session.streaming = false;
        if session.status == SessionStatus::Active {
            session.status = SessionStatus::Completed;
        }
        session.touch();
    }

    /// Stop showing `id` as streaming. Returns the identity to ask the server to abort,
    /// `None` if the server never told us one.
    pub fn abort(&mut self, id: &str) -> Option<String> {
        let session = self.get_mut(id)?;
        session.streaming = false;
        if session.status == SessionStatus::Active {
            session.status = SessionStatus::Completed;
        }
        session.touch();
        (!session.placeholder).then(|| session.id.clone())
    }

    pub fn select(&mut self, id: &str) -> bool {
        match self.resolve(id) {
            Ok(key) => {
                self.selected = Some(key);
                true
            }
            Err(_) => false,
        }
    }

    /// Add a session fetched from the server and select it.
    pub fn adopt(&mut self, snapshot: SessionSnapshot) {
        let mut session = LocalSession::new(snapshot.id.clone(), false);
        session.messages = snapshot.messages;
        session.status = snapshot.status;
        session.created_at = snapshot.created_at;
        session.updated_at = snapshot.updated_at;
        self.selected = Some(snapshot.id.clone());
        self.sessions.insert(snapshot.id, session);
    }

    pub fn selected(&self) -> Option<&LocalSession> {
        self.selected.as_deref().and_then(|id| self.sessions.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&LocalSession> {
        self.resolve(id).ok().and_then(|key| self.sessions.get(&key))
    }

    /// Sessions, oldest first.
    pub fn list(&self) -> Vec<&LocalSession> {
        let mut sessions: Vec<&LocalSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Drop placeholder sessions that are not streaming and have been idle for `ttl`.
    pub fn reap_orphans(&mut self, ttl: Duration) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            let idle = (now - session.updated_at).to_std().unwrap_or_default();
            let orphan = session.placeholder && !session.streaming && idle >= ttl;
            if orphan {
                debug!("dropping orphaned local session {}", id);
            }
            !orphan
        });
        if self
            .selected
            .as_ref()
            .is_some_and(|id| !self.sessions.contains_key(id))
        {
            self.selected = None;
        }
        before - self.sessions.len()
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut LocalSession> {
        let key = self.resolve(id).ok()?;
        self.sessions.get_mut(&key)
    }

    fn resolve(&self, id: &str) -> StoreResult<String> {
        if self.sessions.contains_key(id) {
            return Ok(id.to_string());
        }
        self.sessions
            .values()
            .find(|s| s.aliases.iter().any(|alias| alias == id))
            .map(|s| s.id.clone())
            .ok_or_else(|| StoreError::UnknownSession(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::is_placeholder;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> Frame {
        Frame::Message(serde_json::from_value(value).unwrap())
    }

    fn init(id: &str) -> Frame {
        frame(json!({"type": "system", "subtype": "init", "session_id": id}))
    }

    fn assistant(id: &str, text: &str) -> Frame {
        frame(json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
            "session_id": id
        }))
    }

    fn result(id: &str) -> Frame {
        frame(json!({"type": "result", "subtype": "success", "session_id": id}))
    }

    fn kinds(session: &LocalSession) -> Vec<&'static str> {
        session.messages.iter().map(Message::kind).collect()
    }

    #[test]
    fn test_submit_shows_prompt_under_placeholder() {
        let mut store = SessionStore::new();
        let submission = store.submit("hello").unwrap();

        assert!(is_placeholder(&submission.local_id));
        assert_eq!(submission.resume, None);
        let selected = store.selected().unwrap();
        assert_eq!(selected.id, submission.local_id);
        assert!(selected.streaming);
        assert_eq!(kinds(selected), vec!["user"]);
    }

    #[test]
    fn test_end_to_end_rename_and_completion() {
        let mut store = SessionStore::new();
        let temp = store.submit("hello").unwrap().local_id;

        let outcome = store.apply(&temp, init("S1")).unwrap();
        assert_eq!(outcome.id, "S1");
        store.apply(&temp, assistant("S1", "hi")).unwrap();
        store.apply("S1", result("S1")).unwrap();
        let done = store.apply("S1", Frame::Done).unwrap();
        assert!(done.done);

        assert_eq!(store.list().len(), 1);
        let session = store.selected().unwrap();
        assert_eq!(session.id, "S1");
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(!session.streaming);
        assert!(!session.placeholder);
        assert_eq!(kinds(session), vec!["user", "system", "assistant", "result"]);
        assert!(session.messages.iter().all(|m| m.session_id() == Some("S1")));
        assert_eq!(store.get(&temp).unwrap().id, "S1");
    }

    #[test]
    fn test_continue_then_resume_rename() {
        let mut store = SessionStore::new();
        let temp = store.submit("one").unwrap().local_id;
        store.apply(&temp, init("A")).unwrap();
        store.apply("A", Frame::Done).unwrap();

        let submission = store.submit("two").unwrap();
        assert_eq!(submission.local_id, "A");
        assert_eq!(submission.resume.as_deref(), Some("A"));

        store.apply("A", init("B")).unwrap();
        store.apply("A", assistant("A", "stale identity")).unwrap();
        store.apply("B", Frame::Done).unwrap();

        assert_eq!(store.list().len(), 1);
        let session = store.selected().unwrap();
        assert_eq!(session.id, "B");
        assert_eq!(session.aliases, vec![temp, "A".to_string()]);
        assert_eq!(
            kinds(session),
            vec!["user", "system", "user", "system", "assistant"]
        );
        assert!(session.messages.iter().all(|m| m.session_id() == Some("B")));
    }

    #[test]
    fn test_submit_while_streaming_is_busy() {
        let mut store = SessionStore::new();
        let temp = store.submit("one").unwrap().local_id;
        assert_eq!(store.submit("two"), Err(StoreError::Busy(temp)));
    }

    #[test]
    fn test_failed_placeholder_is_not_resumed() {
        let mut store = SessionStore::new();
        let temp = store.submit("one").unwrap().local_id;
        store.fail(&temp, "connection refused");

        let failed = store.get(&temp).unwrap();
        assert_eq!(failed.status, SessionStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("connection refused"));
        assert_eq!(kinds(failed), vec!["user"]);

        let retry = store.submit("one again").unwrap();
        assert_ne!(retry.local_id, temp);
        assert_eq!(retry.resume, None);
    }

    #[test]
    fn test_error_frame_marks_session() {
        let mut store = SessionStore::new();
        let temp = store.submit("hello").unwrap().local_id;
        store.apply(&temp, init("S1")).unwrap();
        store
            .apply("S1", Frame::Message(Message::error("agent failed: boom", Some("S1".into()))))
            .unwrap();
        store.apply("S1", Frame::Done).unwrap();

        let session = store.get("S1").unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.last_error.as_deref(), Some("agent failed: boom"));
        assert!(!session.streaming);
    }

    #[test]
    fn test_abort_clears_streaming_immediately() {
        let mut store = SessionStore::new();
        let temp = store.submit("hello").unwrap().local_id;
        assert_eq!(store.abort(&temp), None);
        assert!(!store.get(&temp).unwrap().streaming);

        store.new_conversation();
        let second = store.submit("again").unwrap().local_id;
        store.apply(&second, init("S2")).unwrap();
        assert_eq!(store.abort("S2").as_deref(), Some("S2"));
        assert_eq!(store.get("S2").unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn test_reap_orphans_and_selection() {
        let mut store = SessionStore::new();
        let temp = store.submit("hello").unwrap().local_id;
        assert_eq!(store.reap_orphans(Duration::ZERO), 0);

        store.fail(&temp, "down");
        assert_eq!(store.reap_orphans(Duration::from_secs(3600)), 0);
        assert_eq!(store.reap_orphans(Duration::ZERO), 1);
        assert!(store.selected().is_none());
        assert!(!store.select(&temp));
    }
}
