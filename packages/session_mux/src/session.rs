//! Per-session state records.
//!
//! Every session carries its own reconnect, history and streaming state.
//! Nothing here is shared between sessions; handlers receive the record for
//! the session a frame was routed to and mutate only that.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::SurfacedError;
use crate::frame::Channel;

/// Stable handle for a session. Survives renames, unlike the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    System,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// A committed (or buffered) conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// How one channel of a session was subscribed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBinding {
    /// Key the channel's route is registered under. Differs from the
    /// session key while another channel has already adopted a durable key.
    pub connection_key: String,
    /// Payload of the original `connect`, replayed with `resume: true`.
    pub connect_params: Value,
    /// The server answered this channel's connect at least once. Only
    /// acknowledged channels are resumed; others still have their first
    /// connect in flight.
    pub acknowledged: bool,
}

impl ChannelBinding {
    pub fn new(connection_key: impl Into<String>, connect_params: Value) -> Self {
        Self {
            connection_key: connection_key.into(),
            connect_params,
            acknowledged: false,
        }
    }
}

/// A reconnect timer armed for one channel of a session.
#[derive(Debug)]
pub struct PendingReconnect {
    pub seq: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct ReconnectState {
    pub should_reconnect: bool,
    /// Attempts since the last channel of this session came back.
    pub attempts: u32,
    pub pending: BTreeMap<Channel, PendingReconnect>,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            should_reconnect: true,
            attempts: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl ReconnectState {
    /// Disarm `channel`'s timer, if any.
    pub fn cancel(&mut self, channel: Channel) {
        if let Some(pending) = self.pending.remove(&channel) {
            pending.cancel.cancel();
        }
    }

    /// Disarm every channel's timer.
    pub fn cancel_all(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            pending.cancel.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_pending_for(&self, channel: Channel) -> bool {
        self.pending.contains_key(&channel)
    }

    /// `channel` is connected again. The attempt budget is refreshed once no
    /// other channel is still waiting to reconnect.
    pub fn reset(&mut self, channel: Channel) {
        self.cancel(channel);
        if self.pending.is_empty() {
            self.attempts = 0;
        }
    }
}

/// An outstanding `load_more_history` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub before_index: u64,
    pub limit: u32,
}

#[derive(Debug, Default)]
pub struct HistoryState {
    /// Index of the oldest message held locally; `None` until the server
    /// reports history bounds.
    pub oldest_loaded_index: Option<u64>,
    pub has_more_history: bool,
    pub is_loading_history: bool,
    /// Content received while loading, in arrival order.
    pub pending_messages: Vec<Message>,
    /// Set when a reconnect's backfill must not be replayed onto an already
    /// populated log.
    pub skip_flush: bool,
    pub page_request: Option<PageRequest>,
}

impl HistoryState {
    /// Whether an older page may be requested right now.
    pub fn can_load_more(&self) -> bool {
        !self.is_loading_history && self.has_more_history && self.oldest_loaded_index.is_some()
    }
}

#[derive(Debug, Default)]
pub struct StreamingState {
    pub is_streaming: bool,
    pub streaming_message_id: Option<String>,
    pub buffer: String,
    pub thinking: bool,
    pub active_tool: Option<String>,
}

impl StreamingState {
    /// Clear every in-progress marker. Returns true if any was set.
    pub fn sweep(&mut self) -> bool {
        let was_active = self.is_streaming
            || self.streaming_message_id.is_some()
            || self.thinking
            || self.active_tool.is_some();
        self.is_streaming = false;
        self.streaming_message_id = None;
        self.buffer.clear();
        self.thinking = false;
        self.active_tool = None;
        was_active
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub key: String,
    pub name: String,
    pub status: SessionStatus,
    pub channels: BTreeMap<Channel, ChannelBinding>,
    pub reconnect: ReconnectState,
    pub history: HistoryState,
    pub streaming: StreamingState,
    pub messages: Vec<Message>,
    /// Unsent input saved while the session is in the background.
    pub draft: String,
}

impl Session {
    pub fn new(id: SessionId, key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            name: name.into(),
            status: SessionStatus::Idle,
            channels: BTreeMap::new(),
            reconnect: ReconnectState::default(),
            history: HistoryState::default(),
            streaming: StreamingState::default(),
            messages: Vec::new(),
            draft: String::new(),
        }
    }

    pub fn binding(&self, channel: Channel) -> Option<&ChannelBinding> {
        self.channels.get(&channel)
    }

}

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened {
        key: String,
    },
    Activated {
        key: String,
        previous: Option<String>,
    },
    Minimized {
        key: String,
    },
    Renamed {
        from: String,
        to: String,
    },
    Closed {
        key: String,
    },
    StatusChanged {
        key: String,
        status: SessionStatus,
    },
    ReconnectScheduled {
        key: String,
        attempt: u32,
        delay: Duration,
    },
    ReconnectGaveUp {
        key: String,
        attempts: u32,
    },
    Committed {
        key: String,
        message: Message,
    },
    StreamDelta {
        key: String,
        message_id: String,
        text: String,
    },
    StreamFinished {
        key: String,
        message_id: Option<String>,
    },
    Thinking {
        key: String,
        active: bool,
    },
    ToolActive {
        key: String,
        name: Option<String>,
    },
    HistoryLoaded {
        key: String,
        committed: usize,
        has_more: bool,
    },
    HistoryPrepended {
        key: String,
        count: usize,
        /// First message before the prepend; keep it in view.
        anchor: Option<String>,
        has_more: bool,
    },
    StalePageDiscarded {
        key: String,
    },
    ShellOutput {
        key: String,
        data: String,
    },
    ShellExited {
        key: String,
        code: Option<i32>,
    },
    Error {
        key: String,
        error: SurfacedError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_reports_activity() {
        let mut s = StreamingState::default();
        assert!(!s.sweep());
        s.thinking = true;
        s.buffer.push_str("partial");
        assert!(s.sweep());
        assert!(s.buffer.is_empty());
        assert!(!s.thinking);
    }

    fn armed(r: &mut ReconnectState, channel: Channel, seq: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        r.pending.insert(
            channel,
            PendingReconnect {
                seq,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    #[test]
    fn reset_cancels_only_that_channel() {
        let mut r = ReconnectState {
            attempts: 4,
            ..Default::default()
        };
        let agent = armed(&mut r, Channel::Agent, 1);
        let shell = armed(&mut r, Channel::Shell, 2);

        r.reset(Channel::Shell);
        assert!(shell.is_cancelled());
        assert!(!agent.is_cancelled());
        assert!(r.is_pending_for(Channel::Agent));
        // the agent is still backing off
        assert_eq!(r.attempts, 4);

        r.reset(Channel::Agent);
        assert!(agent.is_cancelled());
        assert!(!r.is_pending());
        assert_eq!(r.attempts, 0);
    }

    #[test]
    fn cancel_all_disarms_every_channel() {
        let mut r = ReconnectState::default();
        let agent = armed(&mut r, Channel::Agent, 1);
        let shell = armed(&mut r, Channel::Shell, 2);
        r.cancel_all();
        assert!(agent.is_cancelled() && shell.is_cancelled());
        assert!(!r.is_pending());
    }

    #[test]
    fn new_binding_is_unacknowledged() {
        let b = ChannelBinding::new("new-1", Value::Null);
        assert_eq!(b.connection_key, "new-1");
        assert!(!b.acknowledged);
    }

    #[test]
    fn can_load_more_needs_known_index() {
        let mut h = HistoryState::default();
        h.has_more_history = true;
        assert!(!h.can_load_more());
        h.oldest_loaded_index = Some(20);
        assert!(h.can_load_more());
        h.is_loading_history = true;
        assert!(!h.can_load_more());
    }
}
