//! Connection states, events and the transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Suspended,
    Failed,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 6] = [
        Self::Idle,
        Self::Connecting,
        Self::Connected,
        Self::Reconnecting,
        Self::Suspended,
        Self::Failed,
    ];
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Suspended => write!(f, "suspended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Caller asked for a connection.
    Connect,
    /// The socket opened.
    Connected,
    /// An open attempt failed.
    Error,
    /// An open socket closed.
    Disconnected,
    /// Page hidden / app backgrounded.
    Suspend,
    /// Page visible again.
    Resume,
    /// Retry budget exhausted.
    MaxRetries,
    /// Manual retry after failure.
    Retry,
    /// Caller tore the connection down.
    Disconnect,
}

impl ConnectionEvent {
    pub const ALL: [ConnectionEvent; 9] = [
        Self::Connect,
        Self::Connected,
        Self::Error,
        Self::Disconnected,
        Self::Suspend,
        Self::Resume,
        Self::MaxRetries,
        Self::Retry,
        Self::Disconnect,
    ];
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::MaxRetries => "max_retries",
            Self::Retry => "retry",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Look up the next state. `None` means the event is not defined from `from`
/// and must be ignored.
pub fn transition(from: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState::*;

    match (from, event) {
        (_, E::Disconnect) => Some(Idle),

        (Idle, E::Connect) => Some(Connecting),

        (Connecting, E::Connected) => Some(Connected),
        (Connecting, E::Error) => Some(Reconnecting),

        (Connected, E::Disconnected) => Some(Reconnecting),
        (Connected, E::Suspend) => Some(Suspended),

        (Reconnecting, E::Connected) => Some(Connected),
        (Reconnecting, E::Error) => Some(Reconnecting),
        (Reconnecting, E::MaxRetries) => Some(Failed),
        (Reconnecting, E::Suspend) => Some(Suspended),

        (Suspended, E::Resume) => Some(Reconnecting),
        // a backgrounded client must not restart its own backoff clock
        (Suspended, E::Error | E::Disconnected) => Some(Suspended),

        (Failed, E::Retry) => Some(Connecting),

        _ => None,
    }
}
