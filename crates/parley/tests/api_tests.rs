//! API integration tests.

use axum::{
    Json, Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    routing::{get, post},
};
use futures::StreamExt;
use parley::agent::ScriptStep;
use parley_protocol::{Message, SessionStatus};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{assistant, frame_payloads, init, result, test_app, test_app_with_narration};

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn read_frames(response: axum::response::Response) -> Vec<String> {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    frame_payloads(&body)
}

fn kinds(messages: &[Message]) -> Vec<&'static str> {
    messages.iter().map(Message::kind).collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_start_chat_streams_and_records_session() {
    let app = test_app();
    app.backend.push_script(vec![
        ScriptStep::Emit(init("S1")),
        ScriptStep::Emit(assistant("S1", "hi")),
        ScriptStep::Emit(result("S1")),
    ]);

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/chat/start",
            json!({"prompt": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let frames = read_frames(response).await;
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[3], "[DONE]");
    let first: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(first["type"], "system");
    assert_eq!(first["session_id"], "S1");
    let second: Value = serde_json::from_str(&frames[1]).unwrap();
    assert_eq!(second["message"]["content"][0]["text"], "hi");

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/api/chat/sessions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sessions = read_json(response).await;
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], "S1");
    assert_eq!(sessions[0]["status"], "completed");
    assert_eq!(sessions[0]["streaming"], false);
    assert!(sessions[0]["createdAt"].is_string());
    assert!(sessions[0]["updatedAt"].is_string());

    let session = app.registry.get("S1").unwrap();
    assert_eq!(kinds(&session.messages), vec!["user", "system", "assistant", "result"]);
}

#[tokio::test]
async fn test_start_chat_requires_prompt() {
    let app = test_app();

    let response = app
        .router
        .oneshot(json_request(Method::POST, "/api/chat/start", json!({"prompt": "  "})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = read_json(response).await;
    assert_eq!(json["error"], "Prompt is required");
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(app.backend.queries().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/chat/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_continue_requires_session_and_prompt() {
    let app = test_app();

    let response = app
        .router
        .oneshot(json_request(
            Method::POST,
            "/api/chat/continue",
            json!({"prompt": "again"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = read_json(response).await;
    assert_eq!(json["error"], "sessionId and prompt are required");
}

#[tokio::test]
async fn test_continue_with_new_identity_renames_session() {
    let app = test_app();
    app.backend
        .push_script(vec![ScriptStep::Emit(init("A")), ScriptStep::Emit(result("A"))]);
    app.backend.push_script(vec![
        ScriptStep::Emit(init("B")),
        ScriptStep::Emit(assistant("B", "still here")),
        ScriptStep::Emit(result("B")),
    ]);

    let response = app
        .router
        .clone()
        .oneshot(json_request(Method::POST, "/api/chat/start", json!({"prompt": "one"})))
        .await
        .unwrap();
    read_frames(response).await;

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/chat/continue",
            json!({"sessionId": "A", "prompt": "two"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let frames = read_frames(response).await;
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));

    let queries = app.backend.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1].query.resume.as_deref(), Some("A"));

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/api/chat/sessions/A"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = read_json(response).await;
    assert_eq!(session["id"], "B");
    let messages = session["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 7);
    assert!(messages.iter().all(|m| m["session_id"] == "B"));
    assert_eq!(app.registry.len(), 1);
}

#[tokio::test]
async fn test_get_unknown_session_is_not_found() {
    let app = test_app();

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/api/chat/sessions/missing"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = read_json(response).await;
    assert_eq!(json["error"], "Session not found");
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_abort_without_stream_is_not_found() {
    let app = test_app();

    let response = app
        .router
        .oneshot(empty_request(Method::DELETE, "/api/chat/sessions/S1/abort"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = read_json(response).await;
    assert_eq!(json["error"], "Session not found or already completed");
}

#[tokio::test]
async fn test_abort_in_flight_stream() {
    let app = test_app();
    app.backend
        .push_script(vec![ScriptStep::Emit(init("S1")), ScriptStep::AwaitCancel]);

    let response = app
        .router
        .clone()
        .oneshot(json_request(Method::POST, "/api/chat/start", json!({"prompt": "hello"})))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("\"session_id\":\"S1\""));

    // a second stream on the same session is refused while the first is open
    app.backend
        .push_script(vec![ScriptStep::Emit(init("S1")), ScriptStep::Emit(result("S1"))]);
    let conflict = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/chat/continue",
            json!({"sessionId": "S1", "prompt": "again"}),
        ))
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    let response = app
        .router
        .oneshot(empty_request(Method::DELETE, "/api/chat/sessions/S1/abort"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["message"], "Session aborted");

    let mut rest = Vec::new();
    while let Some(chunk) = body.next().await {
        rest.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(frame_payloads(&rest), vec!["[DONE]".to_string()]);

    let session = app.registry.get("S1").unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(!session.streaming);
}

#[tokio::test]
async fn test_backend_failure_sends_error_frame_then_done() {
    let app = test_app();
    app.backend
        .push_script(vec![ScriptStep::Emit(init("S1")), ScriptStep::Fail("boom".into())]);

    let response = app
        .router
        .oneshot(json_request(Method::POST, "/api/chat/start", json!({"prompt": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = read_frames(response).await;
    assert_eq!(frames.len(), 3);
    let error: Value = serde_json::from_str(&frames[1]).unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["session_id"], "S1");
    assert!(error["error"].as_str().unwrap().contains("boom"));
    assert_eq!(frames[2], "[DONE]");

    let session = app.registry.get("S1").unwrap();
    assert_eq!(session.status, SessionStatus::Error);
}

#[tokio::test]
async fn test_invalid_mcp_config_is_rejected() {
    let app = test_app();

    let response = app
        .router
        .oneshot(json_request(
            Method::POST,
            "/api/chat/start",
            json!({"prompt": "hello", "options": {"mcpConfig": "{broken"}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = read_json(response).await;
    assert!(json["error"].as_str().unwrap().starts_with("Invalid mcpConfig"));
    assert!(app.backend.queries().is_empty());
}

#[tokio::test]
async fn test_options_reach_the_backend() {
    let app = test_app();
    app.backend
        .push_script(vec![ScriptStep::Emit(init("S1")), ScriptStep::Emit(result("S1"))]);
    let mcp = json!({"mcpServers": {"files": {"command": "mcp-files", "args": []}}}).to_string();

    let response = app
        .router
        .oneshot(json_request(
            Method::POST,
            "/api/chat/start",
            json!({
                "prompt": "hello",
                "options": {"maxTurns": 3, "model": "sonnet", "mcpConfig": mcp}
            }),
        ))
        .await
        .unwrap();
    read_frames(response).await;

    let queries = app.backend.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query.options.max_turns, Some(3));
    assert_eq!(queries[0].query.options.model.as_deref(), Some("sonnet"));
    let written: Value = serde_json::from_str(queries[0].mcp_config.as_deref().unwrap()).unwrap();
    assert_eq!(written["mcpServers"]["files"]["command"], "mcp-files");
    assert!(!queries[0].query.mcp_config_path.as_ref().unwrap().exists());
}

#[tokio::test]
async fn test_cwd_endpoint() {
    let app = test_app();

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/api/chat/cwd"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert!(!json["cwd"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_route_is_json_not_found() {
    let app = test_app();

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/api/nope"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = read_json(response).await;
    assert_eq!(json["error"], "Not found");
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["details"], "/api/nope");
}

#[tokio::test]
async fn test_narration_requires_api_key() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/narration/generate",
            json!({"actorId": "a1", "text": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(response).await["error"], "Narration API key is required");

    let response = app
        .router
        .oneshot(empty_request(Method::GET, "/api/narration/actors"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_narration_requires_actor_and_text() {
    let app = test_app();

    let mut request = json_request(Method::POST, "/api/narration/generate", json!({"text": "hi"}));
    request
        .headers_mut()
        .insert("x-narration-api-key", "secret".parse().unwrap());
    let response = app.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["error"], "actorId and text are required");
}

#[tokio::test]
async fn test_narration_passes_through_to_voice_service() {
    let upstream = Router::new()
        .route(
            "/voice-actors",
            get(|| async { Json(json!({"voiceActors": [{"id": "a1", "name": "Aoi"}]})) }),
        )
        .route(
            "/voice-actors/{id}/generate-encoded-voice",
            post(|| async {
                Json(json!({"generatedVoice": {"base64Audio": "UklGRg=="}}))
            }),
        )
        .route(
            "/voice-actors/forbidden/generate-encoded-voice",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({"message": "invalid api key"})),
                )
            }),
        );
    let base_url = common::serve(upstream).await;
    let app = test_app_with_narration(&base_url);

    let mut request = empty_request(Method::GET, "/api/narration/actors");
    request
        .headers_mut()
        .insert("x-narration-api-key", "secret".parse().unwrap());
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["voiceActors"][0]["name"], "Aoi");

    let mut request = json_request(
        Method::POST,
        "/api/narration/generate",
        json!({"actorId": "a1", "text": "こんにちは"}),
    );
    request
        .headers_mut()
        .insert("x-narration-api-key", "secret".parse().unwrap());
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_json(response).await["generatedVoice"]["base64Audio"],
        "UklGRg=="
    );

    let mut request = json_request(
        Method::POST,
        "/api/narration/generate",
        json!({"actorId": "forbidden", "text": "hi"}),
    );
    request
        .headers_mut()
        .insert("x-narration-api-key", "wrong".parse().unwrap());
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = read_json(response).await;
    assert_eq!(json["error"], "Failed to generate voice");
    assert_eq!(json["code"], "UPSTREAM_ERROR");
    assert!(json["details"].as_str().unwrap().contains("invalid api key"));
}
