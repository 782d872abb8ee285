//! Wire frames shared by every channel on the multiplexed socket.
//!
//! Frame: `{ "channel": "...", "sessionKey": "..." | null, "type": "...", "payload": {...} }`
//!
//! Text messages carry JSON, binary messages carry CBOR. Both encodings are
//! always accepted on the way in; the outbound encoding is a configuration
//! choice.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;

/// Maximum encoded frame size (1 MiB). Larger frames are rejected.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Payload key the server uses to name the temporary key it replaced.
const ORIGINAL_KEY_FIELDS: [&str; 2] = ["original_session_id", "originalSessionKey"];

/// Logical channel a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Reserved for the auth handshake and heartbeat.
    System,
    /// Interactive pseudo-terminal.
    Shell,
    /// Conversational agent.
    Agent,
}

impl Channel {
    pub fn is_system(self) -> bool {
        self == Channel::System
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Shell => write!(f, "shell"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// One multiplexed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: Channel,
    #[serde(rename = "sessionKey", default)]
    pub session_key: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(
        channel: Channel,
        session_key: Option<&str>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            channel,
            session_key: session_key.map(str::to_string),
            kind: kind.into(),
            payload,
        }
    }

    /// A frame on the reserved `system` channel.
    pub fn system(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(Channel::System, None, kind, payload)
    }

    /// The temporary key the server says this frame's key replaced, if any.
    pub fn original_session_key(&self) -> Option<&str> {
        ORIGINAL_KEY_FIELDS
            .iter()
            .find_map(|field| self.payload.get(*field).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    }

    /// True for the reply types that open a channel session.
    pub fn is_initial_connect(&self) -> bool {
        matches!(self.kind.as_str(), "connected" | "ready")
    }

    /// Re-shape as `{ "type": ..., "payload": ... }` for adjacently tagged
    /// protocol enums. A missing payload becomes an empty object.
    pub fn tagged(&self) -> Value {
        let payload = match &self.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::json!({ "type": self.kind, "payload": payload })
    }
}

/// Outbound encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Json,
    Cbor,
}

/// A message as it crosses the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a frame for the wire.
pub fn encode(frame: &Frame, encoding: Encoding) -> Result<WireMessage, FrameError> {
    let msg = match encoding {
        Encoding::Json => WireMessage::Text(serde_json::to_string(frame)?),
        Encoding::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(frame, &mut buf)
                .map_err(|e| FrameError::Cbor(e.to_string()))?;
            WireMessage::Binary(buf)
        }
    };
    if msg.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: msg.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(msg)
}

/// Decode a frame from the wire, picking the codec from the message kind.
pub fn decode(msg: &WireMessage) -> Result<Frame, FrameError> {
    if msg.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: msg.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    match msg {
        WireMessage::Text(text) => Ok(serde_json::from_str(text)?),
        WireMessage::Binary(bytes) => {
            ciborium::from_reader(bytes.as_slice()).map_err(|e| FrameError::Cbor(e.to_string()))
        }
    }
}
