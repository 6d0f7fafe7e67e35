//! Narration generator HTTP client.
//!
//! Talks either to the voice service directly or to a parley server's narration
//! pass-through. Both answer with the same JSON shapes.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use log::debug;
use parley_protocol::{GenerateNarrationRequest, UpstreamGenerateBody};
use reqwest::Client;
use serde_json::Value;

use super::error::{NarrationError, NarrationResult};
use crate::config::NarrationConfig;

/// Credential header expected by the voice service.
pub const UPSTREAM_KEY_HEADER: &str = "x-api-key";

/// Credential header of the server's narration pass-through.
pub const NARRATION_KEY_HEADER: &str = "x-narration-api-key";

/// Where generated audio may sit in a response, in lookup order.
const AUDIO_FIELDS: &[&[&str]] = &[
    &["generatedVoice", "base64Audio"],
    &["generatedVoice", "audioContent"],
    &["generatedVoice", "audioFileUrl"],
    &["audioFileUrl"],
    &["audio_file_url"],
    &["audioBase64"],
    &["audio_base64"],
];

#[derive(Debug, Clone)]
enum Endpoint {
    Upstream { base_url: String },
    Proxy { server_url: String },
}

/// Audio located in a generation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Base64 audio, possibly a `data:` URI.
    Inline(String),
    Url(String),
}

/// Decoded audio ready for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Bytes,
    /// File extension of the encoding, e.g. `wav`.
    pub format: String,
}

/// Client for the narration service.
#[derive(Debug, Clone)]
pub struct NarrationClient {
    client: Client,
    endpoint: Endpoint,
    default_format: String,
    default_speed: f32,
}

impl NarrationClient {
    /// Client that calls the voice service directly.
    pub fn upstream(config: &NarrationConfig) -> NarrationResult<Self> {
        Self::build(
            Endpoint::Upstream {
                base_url: config.base_url.trim_end_matches('/').to_string(),
            },
            config,
        )
    }

    /// Client that goes through a parley server at `server_url`.
    pub fn proxy(server_url: &str, config: &NarrationConfig) -> NarrationResult<Self> {
        Self::build(
            Endpoint::Proxy {
                server_url: server_url.trim_end_matches('/').to_string(),
            },
            config,
        )
    }

    fn build(endpoint: Endpoint, config: &NarrationConfig) -> NarrationResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            default_format: config.default_format.clone(),
            default_speed: config.default_speed,
        })
    }

    /// Request audio for `request.text`. Returns the service's JSON unchanged.
    pub async fn generate(
        &self,
        api_key: &str,
        request: &GenerateNarrationRequest,
    ) -> NarrationResult<Value> {
        let response = match &self.endpoint {
            Endpoint::Upstream { base_url } => {
                let url = format!(
                    "{}/voice-actors/{}/generate-encoded-voice",
                    base_url, request.actor_id
                );
                let body = UpstreamGenerateBody {
                    script: request.text.clone(),
                    speed: request.speed.unwrap_or(self.default_speed).to_string(),
                    format: self.format_for(request),
                };
                debug!("generating narration with actor {}", request.actor_id);
                self.client
                    .post(&url)
                    .header(UPSTREAM_KEY_HEADER, api_key)
                    .json(&body)
                    .send()
                    .await?
            }
            Endpoint::Proxy { server_url } => {
                let url = format!("{}/api/narration/generate", server_url);
                self.client
                    .post(&url)
                    .header(NARRATION_KEY_HEADER, api_key)
                    .json(request)
                    .send()
                    .await?
            }
        };

        handle_response(response).await
    }

    /// Fetch the voice-actor catalog. Returns the service's JSON unchanged.
    pub async fn list_actors(&self, api_key: &str) -> NarrationResult<Value> {
        let (url, header) = match &self.endpoint {
            Endpoint::Upstream { base_url } => {
                (format!("{}/voice-actors", base_url), UPSTREAM_KEY_HEADER)
            }
            Endpoint::Proxy { server_url } => (
                format!("{}/api/narration/actors", server_url),
                NARRATION_KEY_HEADER,
            ),
        };
        let response = self.client.get(&url).header(header, api_key).send().await?;

        handle_response(response).await
    }

    /// Download audio referenced by URL.
    pub async fn fetch_audio(&self, url: &str) -> NarrationResult<Bytes> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NarrationError::Upstream {
                status: status.as_u16(),
                message: format!("audio download failed for {}", url),
                body,
            });
        }
        Ok(response.bytes().await?)
    }

    /// Generate and resolve audio in one step, fetching it if the service returned a URL.
    pub async fn synthesize(
        &self,
        api_key: &str,
        request: &GenerateNarrationRequest,
    ) -> NarrationResult<AudioClip> {
        let body = self.generate(api_key, request).await?;
        let bytes = match extract_audio(&body).ok_or(NarrationError::MissingAudio)? {
            AudioSource::Inline(data) => Bytes::from(decode_audio(&data)?),
            AudioSource::Url(url) => self.fetch_audio(&url).await?,
        };

        Ok(AudioClip {
            bytes,
            format: self.format_for(request),
        })
    }

    fn format_for(&self, request: &GenerateNarrationRequest) -> String {
        request
            .format
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| self.default_format.clone())
    }
}

async fn handle_response(response: reqwest::Response) -> NarrationResult<Value> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        serde_json::from_str(&text)
            .map_err(|e| NarrationError::Parse(format!("Failed to parse response: {}", e)))
    } else {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| error_message(&body))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        Err(NarrationError::Upstream {
            status: status.as_u16(),
            message,
            body: text,
        })
    }
}

fn error_message(body: &Value) -> Option<String> {
    ["message", "error"]
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_str))
        .map(str::to_owned)
}

/// Locate the audio in a generation response.
///
/// Values starting with `http` are URLs; anything else is treated as base64 audio.
pub fn extract_audio(body: &Value) -> Option<AudioSource> {
    AUDIO_FIELDS.iter().find_map(|path| {
        let value = path
            .iter()
            .try_fold(body, |node, key| node.get(key))?
            .as_str()?;
        if value.is_empty() {
            None
        } else if value.starts_with("http") {
            Some(AudioSource::Url(value.to_string()))
        } else {
            Some(AudioSource::Inline(value.to_string()))
        }
    })
}

/// Decode base64 audio, accepting a `data:<mime>;base64,` prefix.
pub fn decode_audio(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match data.split_once(',') {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD.decode(payload.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    };
    use serde_json::json;

    #[test]
    fn test_extract_audio_lookup_order() {
        let nested = json!({
            "generatedVoice": {"base64Audio": "AAAA", "audioFileUrl": "https://cdn/x.wav"},
            "audioFileUrl": "https://cdn/y.wav"
        });
        assert_eq!(
            extract_audio(&nested),
            Some(AudioSource::Inline("AAAA".into()))
        );

        let url_only = json!({"generatedVoice": {"audioFileUrl": "https://cdn/x.wav"}});
        assert_eq!(
            extract_audio(&url_only),
            Some(AudioSource::Url("https://cdn/x.wav".into()))
        );

        let flat = json!({"audio_file_url": "", "audioBase64": "QUJD"});
        assert_eq!(extract_audio(&flat), Some(AudioSource::Inline("QUJD".into())));

        assert_eq!(extract_audio(&json!({"generatedVoice": {}})), None);
    }

    #[test]
    fn test_decode_audio_accepts_data_uri() {
        assert_eq!(decode_audio("QUJD").unwrap(), b"ABC");
        assert_eq!(decode_audio("data:audio/wav;base64,QUJD").unwrap(), b"ABC");
        assert!(decode_audio("not base64!").is_err());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(base_url: &str) -> NarrationConfig {
        NarrationConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_synthesize_against_voice_service() {
        let router = Router::new().route(
            "/voice-actors/{actor}/generate-encoded-voice",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers[UPSTREAM_KEY_HEADER], "secret");
                assert_eq!(body["script"], "こんにちは");
                assert_eq!(body["speed"], "1.5");
                assert_eq!(body["format"], "wav");
                Json(json!({"generatedVoice": {"base64Audio": "UklGRg=="}}))
            }),
        );
        let base = serve(router).await;
        let client = NarrationClient::upstream(&config(&base)).unwrap();

        let request = GenerateNarrationRequest {
            actor_id: "a1".into(),
            text: "こんにちは".into(),
            speed: Some(1.5),
            format: None,
        };
        let clip = client.synthesize("secret", &request).await.unwrap();
        assert_eq!(clip.bytes.as_ref(), b"RIFF");
        assert_eq!(clip.format, "wav");
    }

    #[tokio::test]
    async fn test_upstream_status_is_preserved() {
        let router = Router::new().route(
            "/voice-actors",
            get(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({"message": "invalid api key"})),
                )
            }),
        );
        let base = serve(router).await;
        let client = NarrationClient::upstream(&config(&base)).unwrap();

        match client.list_actors("wrong").await {
            Err(NarrationError::Upstream {
                status,
                message,
                body,
            }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "invalid api key");
                assert!(body.contains("invalid api key"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }
}
