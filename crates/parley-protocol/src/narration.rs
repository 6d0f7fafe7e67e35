//! Narration request bodies and voice-actor descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /api/narration/generate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateNarrationRequest {
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Body sent to the upstream voice generator.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamGenerateBody {
    pub script: String,
    /// The upstream API expects the speed as a decimal string.
    pub speed: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceStyle {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One entry of the upstream actor catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceActor {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub styles: Vec<VoiceStyle>,
    #[serde(default, alias = "sample_voice_url", skip_serializing_if = "Option::is_none")]
    pub sample_voice_url: Option<String>,
    #[serde(default, alias = "small_image_url", skip_serializing_if = "Option::is_none")]
    pub small_image_url: Option<String>,
    #[serde(default, alias = "picture_url", skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
}

impl VoiceActor {
    /// Best available avatar image.
    pub fn avatar_url(&self) -> Option<&str> {
        self.small_image_url
            .as_deref()
            .or(self.picture_url.as_deref())
    }
}

/// Extract the actor list from an upstream catalog response.
///
/// The list may sit under several keys, or be the top-level array itself. Entries that
/// do not parse as an actor are skipped.
pub fn actors_from_catalog(body: &Value) -> Vec<VoiceActor> {
    let list = match body {
        Value::Array(items) => Some(items),
        Value::Object(obj) => ["generationVoiceActors", "voiceActors", "voice_actors"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array)),
        _ => None,
    };

    list.map(|items| {
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    })
    .unwrap_or_default()
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
