//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use parley::agent::ScriptedBackend;
use parley::api;
use parley::config::AppConfig;
use parley::narration::NarrationClient;
use parley::session::SessionRegistry;
use parley_protocol::Message;
use serde_json::{Value, json};

/// A router wired to a scripted agent, plus handles to drive and inspect it.
pub struct TestApp {
    pub router: Router,
    pub backend: Arc<ScriptedBackend>,
    pub registry: Arc<SessionRegistry>,
}

/// Create a test application. Narration requests go to an unreachable address.
pub fn test_app() -> TestApp {
    test_app_with_narration("http://127.0.0.1:9")
}

/// Create a test application whose narration requests go to `base_url`.
pub fn test_app_with_narration(base_url: &str) -> TestApp {
    let mut config = AppConfig::default();
    config.narration.base_url = base_url.to_string();
    config.narration.timeout_secs = 5;

    let backend = Arc::new(ScriptedBackend::new());
    let registry = Arc::new(SessionRegistry::new(backend.clone()));
    let narration = NarrationClient::upstream(&config.narration).unwrap();
    let state = api::AppState::new(registry.clone(), narration, &config);

    TestApp {
        router: api::create_router(state),
        backend,
        registry,
    }
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn message(value: Value) -> Message {
    serde_json::from_value(value).unwrap()
}

pub fn init(id: &str) -> Message {
    message(json!({
        "type": "system", "subtype": "init", "session_id": id,
        "cwd": "/work", "tools": ["Read"], "model": "claude"
    }))
}

pub fn assistant(id: &str, text: &str) -> Message {
    message(json!({
        "type": "assistant",
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
        "session_id": id
    }))
}

pub fn result(id: &str) -> Message {
    message(json!({
        "type": "result", "subtype": "success", "is_error": false,
        "result": "done", "session_id": id
    }))
}

/// Split a framed body into its `data:` payloads.
pub fn frame_payloads(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_owned)
        .collect()
}
