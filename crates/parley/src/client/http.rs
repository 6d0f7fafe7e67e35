//! HTTP client for a parley server.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use log::{debug, warn};
use parley_protocol::{
    ChatOptions, ContinueChatRequest, Frame, FrameDecoder, FrameError, SessionSnapshot,
    StartChatRequest,
};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("sending request to server: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stream ended before the terminal frame")]
    UnexpectedEof,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Decoded frames of one chat request. Ends after [`Frame::Done`].
pub type FrameStream = Pin<Box<dyn Stream<Item = ClientResult<Frame>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct ChatClient {
    base_url: String,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> ClientResult<Value> {
        let response = self.client.get(self.url("/health")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Start a new conversation.
    pub async fn start(&self, prompt: &str, options: &ChatOptions) -> ClientResult<FrameStream> {
        let body = StartChatRequest {
            prompt: prompt.to_string(),
            options: Some(options.clone()),
        };
        let response = self
            .client
            .post(self.url("/api/chat/start"))
            .json(&body)
            .send()
            .await?;
        Ok(frames(check(response).await?))
    }

    /// Continue the conversation known as `session_id`.
    pub async fn continue_chat(
        &self,
        session_id: &str,
        prompt: &str,
        options: &ChatOptions,
    ) -> ClientResult<FrameStream> {
        let body = ContinueChatRequest {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            options: Some(options.clone()),
        };
        let response = self
            .client
            .post(self.url("/api/chat/continue"))
            .json(&body)
            .send()
            .await?;
        Ok(frames(check(response).await?))
    }

    /// Ask the server to cancel the in-flight stream. False when nothing was running.
    pub async fn abort(&self, session_id: &str) -> ClientResult<bool> {
        let response = self
            .client
            .delete(self.url(&format!("/api/chat/sessions/{}/abort", session_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    pub async fn sessions(&self) -> ClientResult<Vec<SessionSnapshot>> {
        let response = self.client.get(self.url("/api/chat/sessions")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn session(&self, session_id: &str) -> ClientResult<Option<SessionSnapshot>> {
        let response = self
            .client
            .get(self.url(&format!("/api/chat/sessions/{}", session_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }
}

/// Turn a non-success response into [`ClientError::Status`], using the server's
/// `error` field when the body has one.
async fn check(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or(body);
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

fn frames(response: reqwest::Response) -> FrameStream {
    let reader = FrameReader {
        body: Box::pin(response.bytes_stream()),
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        eof: false,
        done: false,
    };
    Box::pin(stream::unfold(reader, |mut reader| async move {
        let item = reader.next().await?;
        Some((item, reader))
    }))
}

struct FrameReader {
    body: ByteStream,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    eof: bool,
    done: bool,
}

impl FrameReader {
    async fn next(&mut self) -> Option<ClientResult<Frame>> {
        loop {
            if self.done {
                return None;
            }
            if let Some(frame) = self.ready.pop_front() {
                if frame == Frame::Done {
                    self.done = true;
                }
                return Some(Ok(frame));
            }
            if self.eof {
                self.done = true;
                return Some(Err(ClientError::UnexpectedEof));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => {
                    for decoded in self.decoder.push(&chunk) {
                        self.accept(decoded);
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.eof = true;
                    if let Some(decoded) = self.decoder.finish() {
                        self.accept(decoded);
                    }
                }
            }
        }
    }

    fn accept(&mut self, decoded: Result<Frame, FrameError>) {
        match decoded {
            Ok(frame) => self.ready.push_back(frame),
            Err(e) => warn!("skipping undecodable frame: {}", e),
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        if !self.done {
            debug!("frame stream dropped before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        body::Body,
        http::StatusCode as HttpStatus,
        response::IntoResponse,
        routing::{delete, post},
    };
    use serde_json::json;

    async fn serve(router: Router) -> ChatClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ChatClient::new(&format!("http://{}/", addr))
    }

    fn chunked(chunks: Vec<&'static str>) -> Body {
        Body::from_stream(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::convert::Infallible>(Bytes::from(c))),
        ))
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks() {
        let router = Router::new().route(
            "/api/chat/start",
            post(|| async {
                chunked(vec![
                    "data: {\"type\":\"system\",\"subtype\":\"init\",\"sess",
                    "ion_id\":\"S1\"}\n\ndata: not json\n\n",
                    "data: [DONE]\n\n",
                ])
            }),
        );
        let client = serve(router).await;

        let frames: Vec<_> = client
            .start("hello", &ChatOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Ok(Frame::Message(m)) => assert_eq!(m.session_id(), Some("S1")),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(matches!(frames[1], Ok(Frame::Done)));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let router = Router::new().route(
            "/api/chat/start",
            post(|| async {
                chunked(vec![
                    "data: {\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"S1\"}\n\n",
                ])
            }),
        );
        let client = serve(router).await;

        let frames: Vec<_> = client
            .start("hello", &ChatOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Err(ClientError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_error_status_uses_server_message() {
        let router = Router::new()
            .route(
                "/api/chat/continue",
                post(|| async {
                    (
                        HttpStatus::BAD_REQUEST,
                        Json(json!({"error": "sessionId and prompt are required", "code": "BAD_REQUEST"})),
                    )
                        .into_response()
                }),
            )
            .route(
                "/api/chat/sessions/{id}/abort",
                delete(|| async { HttpStatus::NOT_FOUND }),
            );
        let client = serve(router).await;

        let err = client
            .continue_chat("", "hi", &ChatOptions::default())
            .await
            .err()
            .unwrap();
        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "sessionId and prompt are required");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(!client.abort("S1").await.unwrap());
    }
}
