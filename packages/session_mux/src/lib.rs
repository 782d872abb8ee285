//! One socket, many resumable sessions: frame multiplexing, connection
//! lifecycle, the session registry and the channel protocols on top.

pub mod agent;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod shell;
pub mod transport;

pub use agent::AgentChannel;
pub use backoff::BackoffPolicy;
pub use client::MuxClient;
pub use config::{ClientConfig, load_config};
pub use connection::{ConnectionEvent, ConnectionMachine, ConnectionState};
pub use dedup::DedupPolicy;
pub use error::{
    FrameError, ProtocolError, RecoveryAction, SessionError, SurfacedError, TransportError,
};
pub use frame::{Channel, Encoding, Frame};
pub use mux::{ChannelHandler, LinkInfo, MuxConfig, MuxEvent, Multiplexer, SendOutcome};
pub use registry::{NoView, SessionRegistry, SessionView};
pub use session::{Message, MessageKind, Session, SessionEvent, SessionId, SessionStatus};
pub use shell::ShellChannel;
pub use transport::{
    MemoryServer, MemoryTransport, ServerEnd, Transport, WebSocketTransport, memory_pair,
};
