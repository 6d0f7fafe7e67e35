//! parley: multi-turn chat with a coding agent over a framed HTTP stream, with
//! optional spoken narration of the replies.
//!
//! The server side is [`session::SessionRegistry`] behind the [`api`] router; the
//! client side is [`client::ChatSession`] with the [`narration`] queue.

pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod narration;
pub mod relay;
pub mod session;
