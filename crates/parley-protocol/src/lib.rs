//! Wire types for parley agent conversations.
//!
//! This crate defines the formats that cross the HTTP boundary between the parley
//! server and its clients:
//!
//! ```text
//! Client <--[POST + framed stream: data: <json> ... data: [DONE]]--> Server <--> Agent CLI
//!        <--[JSON: session snapshots, narration requests]-------->
//! ```
//!
//! ## Design Principles
//!
//! 1. **Messages are a closed sum type.** Every consumer matches exhaustively on
//!    [`Message`]; unknown content blocks survive a round trip untouched.
//! 2. **Frames are line-delimited.** One `data:` line per message, one reserved
//!    `[DONE]` frame per request. [`FrameDecoder`] reassembles lines split across
//!    network chunks.
//! 3. **Identity is data.** Every message carries the session identity it was
//!    appended under; renames re-stamp with [`restamp`].

pub mod frames;
pub mod identity;
pub mod messages;
pub mod narration;
pub mod sessions;

pub use frames::{DONE_SENTINEL, Frame, FrameDecoder, FrameError, MAX_LINE_LEN};
pub use identity::{PLACEHOLDER_PREFIX, is_placeholder, placeholder_id, restamp};
pub use messages::*;
pub use narration::*;
pub use sessions::*;
