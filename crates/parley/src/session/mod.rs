//! Server-side chat sessions.

mod error;
mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{ChatStream, SessionMessageStream, SessionRegistry};
