//! Stream relay: registry messages to `data:` frames.
//!
//! Every message becomes one frame, flushed as soon as it is produced. A request always
//! ends with exactly one `data: [DONE]` frame; a failure is relayed in-band as an error
//! frame first so the client's read loop still terminates.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    http::{Response, StatusCode},
};
use futures::{Stream, StreamExt, stream};
use log::{debug, error, warn};
use parley_protocol::{Frame, Message};

use crate::session::RegistryResult;

/// Emitted when a message cannot be serialized.
const ENCODE_FAILURE_FRAME: &[u8] =
    b"data: {\"type\":\"error\",\"error\":\"failed to encode message\"}\n\n";

enum Relay<S> {
    Relaying { messages: S, frames: usize },
    Terminating { frames: usize },
    Finished,
}

/// Frame a registry stream.
///
/// Messages are relayed in the order the registry yields them. The source is pulled only
/// when the body wants the next chunk, so a slow reader slows the agent down instead of
/// piling up frames in memory.
pub fn frame_stream<S>(messages: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = RegistryResult<Message>> + Send + Unpin + 'static,
{
    stream::unfold(Relay::Relaying { messages, frames: 0 }, |state| async move {
        match state {
            Relay::Relaying {
                mut messages,
                frames,
            } => match messages.next().await {
                Some(Ok(message)) => Some((
                    encode(&Frame::Message(message)),
                    Relay::Relaying {
                        messages,
                        frames: frames + 1,
                    },
                )),
                Some(Err(e)) => {
                    warn!("relaying stream failure: {}", e);
                    let session_id = e.session_id().map(str::to_owned);
                    let frame = Frame::Message(Message::error(e.to_string(), session_id));
                    Some((encode(&frame), Relay::Terminating { frames: frames + 1 }))
                }
                None => Some(terminate(frames)),
            },
            Relay::Terminating { frames } => Some(terminate(frames)),
            Relay::Finished => None,
        }
    })
}

fn terminate<S>(frames: usize) -> (Result<Bytes, Infallible>, Relay<S>) {
    debug!("relay finished after {} message frames", frames);
    (encode(&Frame::Done), Relay::Finished)
}

fn encode(frame: &Frame) -> Result<Bytes, Infallible> {
    Ok(match frame.encode() {
        Ok(text) => Bytes::from(text),
        Err(e) => {
            error!("Failed to encode frame: {:?}", e);
            Bytes::from_static(ENCODE_FAILURE_FRAME)
        }
    })
}

/// Wrap a framed stream in a streaming HTTP response.
pub fn sse_response<S>(frames: S) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no") // Disable nginx buffering if present
        .body(Body::from_stream(frames))
        .map_err(|e| {
            error!("Failed to build SSE response: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
