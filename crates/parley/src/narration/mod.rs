//! Narration: voice generation client, ordered playback queue, and the text and
//! catalog helpers around them.

mod actors;
mod error;
mod generator;
mod queue;
mod speech;

pub use actors::ActorCache;
pub use error::{NarrationError, NarrationResult};
pub use generator::{
    AudioClip, AudioSource, NARRATION_KEY_HEADER, NarrationClient, UPSTREAM_KEY_HEADER,
    decode_audio, extract_audio,
};
pub use queue::{
    DEFAULT_INTER_ITEM_DELAY, EntrySnapshot, EntryState, GenerateFuture, NarrationQueue, Player,
    QueueOptions, Revealed,
};
pub use speech::{MAX_VOICE_CHUNK, prepare_for_speech, split_for_voice};
