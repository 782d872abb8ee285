//! Physical duplex connections.
//!
//! Submodules:
//! - `websocket`: tokio-tungstenite client
//! - `memory`: in-process loopback, used by tests and embedders

pub mod memory;
pub mod websocket;

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::frame::WireMessage;

pub use memory::{MemoryServer, MemoryTransport, ServerEnd, memory_pair};
pub use websocket::WebSocketTransport;

/// An open socket as seen by the multiplexer.
///
/// Dropping the link (or cancelling `cancel`) closes the socket. When the
/// peer closes, `inbound` yields `None`.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<WireMessage>,
    pub inbound: mpsc::Receiver<WireMessage>,
    pub cancel: CancellationToken,
}

impl TransportLink {
    /// Close the socket and stop its I/O tasks.
    pub fn close(self) {
        self.cancel.cancel();
    }
}

/// Something that can open a fresh socket to the server endpoint.
pub trait Transport: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = Result<TransportLink, TransportError>> + Send;
}
