//! Terminal client for a parley server.

mod chat;
mod http;
mod player;
mod store;

pub use chat::ChatSession;
pub use http::{ChatClient, ClientError, ClientResult, FrameStream};
pub use player::CommandPlayer;
pub use store::{ApplyOutcome, LocalSession, SessionStore, StoreError, StoreResult, Submission};
