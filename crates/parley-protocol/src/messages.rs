//! Conversation messages as emitted by the coding agent in stream-json mode.
//!
//! Only the fields parley reasons about are typed. Everything else is kept in the
//! `extra` maps so a message relayed to a client serializes back to what the agent
//! produced.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The user's prompt, or tool results fed back to the model.
    User(UserMessage),
    /// A model turn.
    Assistant(AssistantMessage),
    /// Session bookkeeping; `subtype: "init"` announces the durable identity.
    System(SystemMessage),
    /// Terminal summary of a query.
    Result(ResultMessage),
    /// A failure while producing the stream.
    Error(ErrorMessage),
}

impl Message {
    /// Build the user's own prompt message.
    pub fn user_prompt(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Message::User(UserMessage {
            message: UserPayload {
                role: "user".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::text(text)]),
            },
            parent_tool_use_id: None,
            session_id: Some(session_id.into()),
            extra: Map::new(),
        })
    }

    /// Build an in-band error message.
    pub fn error(error: impl Into<String>, session_id: Option<String>) -> Self {
        Message::Error(ErrorMessage {
            error: error.into(),
            session_id,
        })
    }

    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::System(_) => "system",
            Message::Result(_) => "result",
            Message::Error(_) => "error",
        }
    }

    /// Session identity this message was emitted or appended under.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::User(m) => m.session_id.as_deref(),
            Message::Assistant(m) => m.session_id.as_deref(),
            Message::System(m) => m.session_id.as_deref(),
            Message::Result(m) => m.session_id.as_deref(),
            Message::Error(m) => m.session_id.as_deref(),
        }
    }

    pub fn set_session_id(&mut self, id: impl Into<String>) {
        let id = Some(id.into());
        match self {
            Message::User(m) => m.session_id = id,
            Message::Assistant(m) => m.session_id = id,
            Message::System(m) => m.session_id = id,
            Message::Result(m) => m.session_id = id,
            Message::Error(m) => m.session_id = id,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Message::Result(_))
    }

    /// Concatenated text blocks of an assistant turn, `None` for other kinds.
    pub fn assistant_text(&self) -> Option<String> {
        match self {
            Message::Assistant(m) => Some(m.message.text()),
            Message::User(_) | Message::System(_) | Message::Result(_) | Message::Error(_) => {
                None
            }
        }
    }

    /// Stable identity for per-reply work (narration), if the agent supplied one.
    pub fn reply_id(&self) -> Option<&str> {
        match self {
            Message::Assistant(m) => m
                .message
                .id
                .as_deref()
                .or_else(|| m.extra.get("uuid").and_then(Value::as_str)),
            Message::User(_) | Message::System(_) | Message::Result(_) | Message::Error(_) => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message: UserPayload,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(default = "default_user_role")]
    pub role: String,
    pub content: MessageContent,
}

fn default_user_role() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantPayload,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The model message inside an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_assistant_role")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_assistant_role() -> String {
    "assistant".to_string()
}

impl AssistantPayload {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerStatus>,
    #[serde(
        default,
        rename = "permissionMode",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_mode: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SystemMessage {
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// User content is either a bare string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A content block. Block types parley does not know are carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Known(KnownBlock),
    Raw(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Known(KnownBlock::Text { text: text.into() })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Known(KnownBlock::Text { text }) => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_system_init() {
        let line = r#"{"type":"system","subtype":"init","cwd":"/work","session_id":"S1","tools":["Bash","Read"],"mcp_servers":[{"name":"fs","status":"connected"}],"model":"claude-sonnet-4-20250514","permissionMode":"default","apiKeySource":"none"}"#;
        let msg: Message = serde_json::from_str(line).unwrap();
        match &msg {
            Message::System(sys) => {
                assert!(sys.is_init());
                assert_eq!(sys.tools, vec!["Bash", "Read"]);
                assert_eq!(sys.mcp_servers[0].status, "connected");
                assert_eq!(sys.extra["apiKeySource"], "none");
            }
            other => panic!("expected system message, got {other:?}"),
        }
        assert_eq!(msg.session_id(), Some("S1"));
    }

    #[test]
    fn test_assistant_text_skips_tool_blocks() {
        let value = json!({
            "type": "assistant",
            "message": {
                "id": "msg_01",
                "role": "assistant",
                "model": "claude",
                "content": [
                    {"type": "text", "text": "Looking at the file."},
                    {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"path": "a.rs"}},
                    {"type": "text", "text": "Done."}
                ]
            },
            "parent_tool_use_id": null,
            "session_id": "S1"
        });
        let msg: Message = serde_json::from_value(value).unwrap();
        assert_eq!(
            msg.assistant_text().as_deref(),
            Some("Looking at the file.\nDone.")
        );
        assert_eq!(msg.reply_id(), Some("msg_01"));
    }

    #[test]
    fn test_unknown_block_survives_round_trip() {
        let value = json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [{"type": "server_tool_use", "id": "x", "payload": [1, 2]}]
            },
            "session_id": "S1",
            "uuid": "u-1"
        });
        let msg: Message = serde_json::from_value(value.clone()).unwrap();
        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["message"]["content"], value["message"]["content"]);
        assert_eq!(back["uuid"], "u-1");
        assert_eq!(msg.reply_id(), Some("u-1"));
    }

    #[test]
    fn test_user_string_content() {
        let msg: Message = serde_json::from_value(json!({
            "type": "user",
            "message": {"role": "user", "content": "plain"},
            "session_id": "S2"
        }))
        .unwrap();
        match msg {
            Message::User(u) => {
                assert_eq!(u.message.content, MessageContent::Text("plain".into()))
            }
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[test]
    fn test_result_and_set_session_id() {
        let mut msg: Message = serde_json::from_value(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "num_turns": 1,
            "result": "hi",
            "session_id": "S1",
            "total_cost_usd": 0.01
        }))
        .unwrap();
        assert!(msg.is_result());
        msg.set_session_id("S9");
        assert_eq!(msg.session_id(), Some("S9"));
        assert_eq!(msg.kind(), "result");
    }
}
