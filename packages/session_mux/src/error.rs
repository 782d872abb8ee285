//! Error types and the recovery hint attached to each surfaced failure.

use serde::{Deserialize, Serialize};

/// Wire encode/decode failures. Always recoverable: the frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("json frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cbor frame: {0}")]
    Cbor(String),

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Failures opening or using the physical connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,
}

impl TransportError {
    pub fn from_tungstenite(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connect(err.to_string())
    }
}

/// Frames that decode but cannot be delivered or understood.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame without session key on channel {0}")]
    MissingSessionKey(crate::frame::Channel),

    #[error("no handler for {channel} session {session_key}")]
    Unroutable {
        channel: crate::frame::Channel,
        session_key: String,
    },

    #[error("unknown {channel} message type {kind:?}: {source}")]
    UnknownMessage {
        channel: crate::frame::Channel,
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of per-session channel calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// What the user (or caller) can do about a surfaced error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Transient; retried automatically.
    Retry,
    /// Credentials were rejected; the caller must connect again with a new token.
    Reauthenticate,
    /// Automatic retries are exhausted; a manual retry is offered.
    ManualRetry,
    /// Permanent; nothing will bring this session back.
    None,
}

/// Errors surfaced to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfacedError {
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("connection failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("session ended: {message}")]
    Permanent { message: String },

    #[error("{message}")]
    Transient { message: String },
}

impl SurfacedError {
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::AuthFailed { .. } => RecoveryAction::Reauthenticate,
            Self::RetriesExhausted { .. } => RecoveryAction::ManualRetry,
            Self::Permanent { .. } => RecoveryAction::None,
            Self::Transient { .. } => RecoveryAction::Retry,
        }
    }
}
