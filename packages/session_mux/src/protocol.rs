//! Per-channel message types.
//!
//! Inbound frames are parsed into tagged enums so every message kind is
//! matched exhaustively. Outbound requests are enums too; `kind()` and
//! `payload()` give the frame's `type` and `payload`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value, json};

use crate::error::ProtocolError;
use crate::frame::Frame;

fn parse<T: DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
    serde_json::from_value(frame.tagged()).map_err(|source| ProtocolError::UnknownMessage {
        channel: frame.channel,
        kind: frame.kind.clone(),
        source,
    })
}

/// Accept either a string or any JSON value, rendered as text.
fn text_or_json<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ── agent channel ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentEvent {
    Ready(Ready),
    HistoryEnd(HistoryEnd),
    HistoryPageEnd(HistoryPageEnd),
    Stream(StreamDelta),
    Thinking(Thinking),
    ToolUse(ContentMessage),
    ToolResult(ContentMessage),
    User(ContentMessage),
    Assistant(ContentMessage),
    Result(TurnResult),
    Error(ErrorPayload),
    Disconnected(Disconnected),
}

impl AgentEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        parse(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ready {
    #[serde(default)]
    pub history_count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryEnd {
    pub total: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryPageEnd {
    pub count: u64,
    #[serde(default)]
    pub has_more: bool,
    pub oldest_index: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamDelta {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Thinking {
    #[serde(default)]
    pub text: String,
}

/// Payload shared by `user`, `assistant`, `tool_use` and `tool_result`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ContentMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "text", deserialize_with = "text_or_json")]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Tool name, for tool messages.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TurnResult {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Disconnected {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentRequest {
    Connect { resume: bool, params: Value },
    Input { text: String },
    Command { name: String, args: Value },
    LoadMoreHistory { before_index: u64, limit: u32 },
    Disconnect,
    Close,
}

impl AgentRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Input { .. } => "input",
            Self::Command { .. } => "command",
            Self::LoadMoreHistory { .. } => "load_more_history",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Connect { resume, params } => with_resume(params, *resume),
            Self::Input { text } => json!({ "text": text }),
            Self::Command { name, args } => json!({ "name": name, "args": args }),
            Self::LoadMoreHistory {
                before_index,
                limit,
            } => json!({ "before_index": before_index, "limit": limit }),
            Self::Disconnect | Self::Close => json!({}),
        }
    }
}

// ── shell channel ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ShellEvent {
    Connected(ShellConnected),
    Output(ShellOutput),
    Exit(ShellExit),
    Error(ErrorPayload),
    Disconnected(Disconnected),
}

impl ShellEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        parse(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ShellConnected {
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShellOutput {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ShellExit {
    #[serde(default)]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShellRequest {
    Connect { cols: u16, rows: u16, resume: bool },
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Disconnect,
    Close,
}

impl ShellRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Connect { cols, rows, resume } => {
                json!({ "cols": cols, "rows": rows, "resume": resume })
            }
            Self::Input { data } => json!({ "data": data }),
            Self::Resize { cols, rows } => json!({ "cols": cols, "rows": rows }),
            Self::Disconnect | Self::Close => json!({}),
        }
    }
}

/// Copy of a connect payload with `resume` set. Non-object params are
/// replaced by `{ "resume": ... }`.
pub fn with_resume(params: &Value, resume: bool) -> Value {
    let mut map = match params {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert("resume".to_string(), Value::Bool(resume));
    Value::Object(map)
}
