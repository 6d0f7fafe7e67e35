//! Session identity helpers shared by the registry and the client store.

use uuid::Uuid;

use crate::messages::Message;

/// Prefix of locally generated identities that await a backend-issued one.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Allocate a fresh placeholder identity.
pub fn placeholder_id() -> String {
    format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn is_placeholder(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

/// Re-stamp every message appended under `from` so it carries `to`.
///
/// Returns the number of messages rewritten. Messages stamped with an older identity
/// (earlier turns of a resumed session) keep theirs.
pub fn restamp(messages: &mut [Message], from: &str, to: &str) -> usize {
    let mut rewritten = 0;
    for message in messages.iter_mut() {
        if message.session_id() == Some(from) {
            message.set_session_id(to);
            rewritten += 1;
        }
    }
    rewritten
}
