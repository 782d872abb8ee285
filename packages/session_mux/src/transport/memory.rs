//! In-process loopback transport.
//!
//! `memory_pair()` returns a client-side [`MemoryTransport`] and a
//! [`MemoryServer`] that accepts each opened socket as a [`ServerEnd`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportLink};
use crate::error::TransportError;
use crate::frame::{self, Channel, Encoding, Frame, WireMessage};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Switchboard {
    refuse: AtomicBool,
    opens: AtomicU32,
}

#[derive(Clone)]
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    board: Arc<Switchboard>,
}

pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
    board: Arc<Switchboard>,
}

/// Create a connected transport/server pair.
pub fn memory_pair() -> (MemoryTransport, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let board = Arc::new(Switchboard::default());
    (
        MemoryTransport {
            accept_tx,
            board: board.clone(),
        },
        MemoryServer { accept_rx, board },
    )
}

impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        self.board.opens.fetch_add(1, Ordering::SeqCst);
        if self.board.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (out_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let end = ServerEnd {
            to_client,
            from_client,
        };
        self.accept_tx
            .send(end)
            .map_err(|_| TransportError::Connect("server gone".to_string()))?;

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
            cancel: CancellationToken::new(),
        })
    }
}

impl MemoryServer {
    /// Wait for the client to open the next socket.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accept_rx.recv().await
    }

    /// Make subsequent opens fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.board.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of open attempts so far, refused ones included.
    pub fn opens(&self) -> u32 {
        self.board.opens.load(Ordering::SeqCst)
    }
}

/// The server's half of one socket.
pub struct ServerEnd {
    to_client: mpsc::Sender<WireMessage>,
    from_client: mpsc::UnboundedReceiver<WireMessage>,
}

impl ServerEnd {
    /// Next frame from the client; `None` once the client dropped the socket.
    /// Undecodable messages are skipped.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let msg = self.from_client.recv().await?;
            if let Ok(frame) = frame::decode(&msg) {
                return Some(frame);
            }
        }
    }

    /// Next frame that is not a heartbeat ping.
    pub async fn recv_skip_ping(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv().await?;
            if !(frame.channel == Channel::System && frame.kind == "ping") {
                return Some(frame);
            }
        }
    }

    /// Frames already sent by the client, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(msg) = self.from_client.try_recv() {
            if let Ok(frame) = frame::decode(&msg) {
                frames.push(frame);
            }
        }
        frames
    }

    pub async fn send(&self, frame: Frame) -> bool {
        match frame::encode(&frame, Encoding::Json) {
            Ok(msg) => self.send_raw(msg).await,
            Err(_) => false,
        }
    }

    /// Send pre-encoded bytes, valid or not.
    pub async fn send_raw(&self, msg: WireMessage) -> bool {
        self.to_client.send(msg).await.is_ok()
    }

    pub async fn send_system(&self, kind: &str, payload: Value) -> bool {
        self.send(Frame::system(kind, payload)).await
    }

    pub async fn send_to(
        &self,
        channel: Channel,
        session_key: &str,
        kind: &str,
        payload: Value,
    ) -> bool {
        self.send(Frame::new(channel, Some(session_key), kind, payload))
            .await
    }

    /// Close from the server side.
    pub fn close(self) {
        drop(self);
    }
}
